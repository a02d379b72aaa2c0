//! Re-derives job completion from the files jobs leave behind.
//!
//! Every completed job has a sentinel record in its stderr file, whichever
//! substrate ran it. A pending job with such a file finished in a run whose
//! bookkeeping was lost, e.g. one that crashed before saving the job table.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::job::{Job, JobStatus};
use crate::sentinel;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub total: usize,
    /// Jobs that reached a terminal state, errors included.
    pub finished: Vec<usize>,
    pub errors: Vec<usize>,
}

impl StatusReport {
    pub fn all_done(&self) -> bool {
        self.finished.len() == self.total
    }
}

/// Classifies every job, marking pending jobs whose stderr file carries a
/// sentinel record as finished.
pub fn scan(jobs: &mut [Job], base_dir: &Path) -> StatusReport {
    let mut report = StatusReport {
        total: jobs.len(),
        ..Default::default()
    };
    for (index, job) in jobs.iter_mut().enumerate() {
        if job.status == JobStatus::Pending && stderr_has_marker(job, base_dir) {
            info!("Marking job {} as Finished", index);
            job.status = JobStatus::Finished;
        }
        match job.status {
            JobStatus::Finished => report.finished.push(index),
            JobStatus::Error => {
                report.finished.push(index);
                report.errors.push(index);
            }
            JobStatus::Pending | JobStatus::Running => {}
        }
    }
    report
}

fn stderr_has_marker(job: &Job, base_dir: &Path) -> bool {
    candidates(job, base_dir)
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .any(|text| sentinel::has_marker(&text))
}

/// Where a job's stderr file may be: the base directory, or its own directory.
fn candidates(job: &Job, base_dir: &Path) -> Vec<PathBuf> {
    let mut paths = vec![job.stderr_path(base_dir)];
    if let Some(dir) = &job.dir {
        paths.push(job.stderr_path(dir));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Work;

    fn jobs(n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| Job::new(Work::Command("true".to_string()), None, 1, format!("s_{}", i)))
            .collect()
    }

    #[test]
    fn test_marker_marks_pending_finished() {
        let dir = tempfile::tempdir().unwrap();
        let mut jobs = jobs(3);
        fs::write(
            dir.path().join("s_1.err"),
            "HDF5:{'name': 'x', 'value': 3.5, 'desc': ''}:5FDH\n",
        )
        .unwrap();
        fs::write(dir.path().join("s_2.err"), "still going\n").unwrap();
        let report = scan(&mut jobs, dir.path());
        assert_eq!(report.finished, vec![1]);
        assert!(report.errors.is_empty());
        assert_eq!(jobs[1].status, JobStatus::Finished);
        assert_eq!(jobs[2].status, JobStatus::Pending);
        assert!(!report.all_done());
    }

    #[test]
    fn test_errors_count_as_finished() {
        let dir = tempfile::tempdir().unwrap();
        let mut jobs = jobs(2);
        jobs[0].status = JobStatus::Error;
        jobs[1].status = JobStatus::Finished;
        let report = scan(&mut jobs, dir.path());
        assert_eq!(report.finished, vec![0, 1]);
        assert_eq!(report.errors, vec![0]);
        assert!(report.all_done());
    }

    #[test]
    fn test_job_directory_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("s_0");
        fs::create_dir(&job_dir).unwrap();
        fs::write(
            job_dir.join("s_0.err"),
            "HDF5:{'name':'time','value':1.0,'desc':''}:5FDH",
        )
        .unwrap();
        let mut jobs = jobs(1);
        jobs[0].dir = Some(job_dir);
        assert_eq!(scan(&mut jobs, dir.path()).finished, vec![0]);
    }
}
