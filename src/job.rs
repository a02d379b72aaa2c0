//! Work items and their persisted records.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SweepError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Finished,
    Error,
}

impl JobStatus {
    /// Pending and previously failed jobs are (re)admitted by `run`.
    pub fn is_runnable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Error)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error)
    }
}

/// What a job executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Work {
    /// A shell command line.
    Command(String),
    /// A call to the host's job function with a serialized argument string.
    Function { function: String, args: String },
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Work::Command(cmd) => write!(f, "{}", cmd),
            Work::Function { function, args } => write!(f, "{}({})", function, args),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub work: Work,
    /// Directory the job runs in. `None` runs in the host's base directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Number of CPUs this job holds while running.
    pub cpus: usize,
    /// Basename of the `.out`/`.err` files.
    pub outfile: String,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    pub fn new(work: Work, dir: Option<PathBuf>, cpus: usize, outfile: impl Into<String>) -> Self {
        Self {
            work,
            dir,
            cpus,
            outfile: outfile.into(),
            status: JobStatus::Pending,
        }
    }

    pub fn stdout_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(format!("{}.out", self.outfile))
    }

    pub fn stderr_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(format!("{}.err", self.outfile))
    }
}

/// A job that ended in error, for console reports.
pub struct FailedJob {
    pub job: usize,
    pub pid: Option<u32>,
    pub work: String,
    pub cause: String,
}

impl fmt::Debug for FailedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "job {} (pid {}): {} {}", self.job, pid, self.work, self.cause),
            None => write!(f, "job {}: {} {}", self.job, self.work, self.cause),
        }
    }
}

/// Every job record shape that may appear in a saved job table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobRecord {
    Current(Job),
    Legacy(LegacyJob),
    /// A legacy record that was saved flattened into a single string.
    Flattened(String),
}

/// The dict-shaped record older job tables hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyJob {
    cmd: String,
    #[serde(default)]
    dir: String,
    #[serde(default)]
    cpu: usize,
    outfile: String,
    #[serde(default)]
    status: LegacyStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum LegacyStatus {
    Code(i64),
    Tag(String),
}

impl Default for LegacyStatus {
    fn default() -> Self {
        LegacyStatus::Code(0)
    }
}

impl From<Job> for JobRecord {
    fn from(job: Job) -> Self {
        JobRecord::Current(job)
    }
}

impl JobRecord {
    /// Migrates any record shape to the current one.
    ///
    /// A job that was running when the table was saved did not survive, so it
    /// comes back as pending.
    pub fn upgrade(self) -> Result<Job, SweepError> {
        let mut job = match self {
            JobRecord::Current(job) => job,
            JobRecord::Legacy(legacy) => legacy.upgrade(),
            JobRecord::Flattened(text) => match serde_yaml::from_str::<JobRecord>(&text)? {
                JobRecord::Flattened(_) => {
                    return Err(SweepError::Yaml(serde::de::Error::custom(format!(
                        "unrecognized job record '{}'",
                        text
                    ))))
                }
                record => record.upgrade()?,
            },
        };
        if job.status == JobStatus::Running {
            job.status = JobStatus::Pending;
        }
        Ok(job)
    }
}

impl LegacyJob {
    fn upgrade(self) -> Job {
        let status = match &self.status {
            LegacyStatus::Code(_) => JobStatus::Pending,
            LegacyStatus::Tag(tag) => match tag.as_str() {
                "F" => JobStatus::Finished,
                "X" => JobStatus::Error,
                _ => JobStatus::Pending,
            },
        };
        let dir = if self.dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(self.dir))
        };
        Job {
            work: Work::Command(self.cmd),
            dir,
            // 0 stands for the host's default; the loading host fills it in.
            cpus: self.cpu,
            outfile: self.outfile,
            status,
        }
    }
}
