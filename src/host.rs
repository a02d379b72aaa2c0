//! The sweep host.
//!
//! A `Host` owns one experiment batch: its capacity configuration, the job
//! table and the test program that turns realizations into jobs. The table
//! can be saved and loaded again, so a later process can resume the jobs that
//! did not finish.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collect::{self, CollectOptions};
use crate::design::Realization;
use crate::error::{ConfigError, SweepError};
use crate::job::{Job, JobRecord, Work};
use crate::pool::{PooledLauncher, WorkerPool};
use crate::process::ProcessLauncher;
use crate::program::TestProgram;
use crate::scheduler::{run_batch, BatchReport, BatchState, RunOptions, Substrate};
use crate::status::{self, StatusReport};
use crate::store::ResultStore;
use crate::sync::LockedFile;

pub struct Host {
    /// CPUs a job gets unless it asks for a specific number.
    cpus: usize,
    /// Total CPU capacity.
    cpus_per_node: usize,
    /// Where job stdout/stderr files and job directories live.
    base_dir: PathBuf,
    /// Basename of job outputs; job `n` of a sweep writes `<fname>_<n>.out`.
    fname: String,
    run_num: usize,
    jobs: Vec<Job>,
    program: Option<Arc<TestProgram>>,
    pool: Option<Arc<WorkerPool>>,
    state: BatchState,
}

impl Host {
    /// `cpus` below 1 means 1. `cpus_per_node == 0` uses every CPU on the machine.
    pub fn new(cpus: usize, cpus_per_node: usize) -> Self {
        let cpus_per_node = match cpus_per_node {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };
        Self {
            cpus: cpus.max(1),
            cpus_per_node,
            base_dir: PathBuf::from("."),
            fname: String::new(),
            run_num: 0,
            jobs: vec![],
            program: None,
            pool: None,
            state: BatchState::Idle,
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_program(mut self, program: TestProgram) -> Self {
        self.program = Some(Arc::new(program));
        self
    }

    /// Runs function programs on `pool` instead of a pool created per batch.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn cpus(&self) -> usize {
        self.cpus
    }

    pub fn cpus_per_node(&self) -> usize {
        self.cpus_per_node
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn fname(&self) -> &str {
        &self.fname
    }

    pub fn program(&self) -> Option<&TestProgram> {
        self.program.as_deref()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Clears the job table for a fresh batch. Capacity settings and the
    /// output counter are kept.
    pub fn reinit(&mut self) {
        self.jobs.clear();
        self.state = BatchState::Idle;
    }

    /// Turns each realization into a job through the test program.
    pub fn add_jobs(
        &mut self,
        fname: &str,
        realizations: impl IntoIterator<Item = Realization>,
    ) -> Result<(), SweepError> {
        let program = self.program.clone().ok_or(ConfigError::NoProgram)?;
        self.fname = fname.to_string();
        for realization in realizations {
            let output = format!("{}_{}", fname, self.run_num);
            let dir = program.setup(&self.base_dir, &output)?;
            let work = program.work(&realization, dir.as_deref())?;
            self.add_job(work, dir, 0, output)?;
            self.run_num += 1;
        }
        Ok(())
    }

    /// Appends one job. `cpus == 0` gives it the host's default.
    pub fn add_job(
        &mut self,
        work: Work,
        dir: Option<PathBuf>,
        cpus: usize,
        outfile: impl Into<String>,
    ) -> Result<(), SweepError> {
        let cpus = if cpus == 0 { self.cpus } else { cpus };
        let dir = match dir {
            Some(dir) if dir.is_relative() => Some(std::env::current_dir()?.join(dir)),
            dir => dir,
        };
        let job = Job::new(work, dir, cpus, outfile);
        debug!(job = self.jobs.len(), work = %job.work, "job added");
        self.jobs.push(job);
        Ok(())
    }

    /// The substrate matching the test program: the worker pool for function
    /// programs, subprocesses otherwise.
    pub fn substrate(&self) -> Box<dyn Substrate> {
        match self.program.as_deref().and_then(TestProgram::function) {
            Some(function) => match &self.pool {
                Some(pool) => Box::new(PooledLauncher::with_pool(function.clone(), Arc::clone(pool))),
                None => Box::new(PooledLauncher::new(function.clone(), self.cpus_per_node)),
            },
            None => Box::new(ProcessLauncher::new()),
        }
    }

    /// Runs every pending or failed job.
    pub async fn run(
        &mut self,
        interrupt: &CancellationToken,
        options: RunOptions,
    ) -> Result<BatchReport, SweepError> {
        let substrate = self.substrate();
        self.run_on(substrate.as_ref(), interrupt, options).await
    }

    /// Runs every pending or failed job on `substrate`.
    pub async fn run_on(
        &mut self,
        substrate: &dyn Substrate,
        interrupt: &CancellationToken,
        options: RunOptions,
    ) -> Result<BatchReport, SweepError> {
        self.state = BatchState::Running;
        let result = run_batch(
            &mut self.jobs,
            &self.base_dir,
            self.cpus_per_node,
            substrate,
            interrupt,
            options,
        )
        .await;
        self.state = match &result {
            Ok(report) => report.state,
            Err(_) => BatchState::Idle,
        };
        result
    }

    /// Re-derives which jobs finished from their stderr files.
    pub fn status(&mut self, quiet: bool) -> StatusReport {
        let report = status::scan(&mut self.jobs, &self.base_dir);
        if !quiet {
            println!("Finished {} out of {} jobs.", report.finished.len(), report.total);
            if !report.errors.is_empty() {
                println!("{} jobs had errors.", report.errors.len());
            }
        }
        report
    }

    /// Stores every finished job not yet in `store`.
    pub fn collect(&mut self, store: &mut dyn ResultStore) -> Result<Vec<usize>, SweepError> {
        let report = self.status(true);
        let options = match self.program.as_deref() {
            Some(program) => CollectOptions {
                outfiles: program.outfiles(),
                newdir: program.newdir(),
            },
            None => CollectOptions::default(),
        };
        collect::collect(&self.jobs, &report.finished, &self.base_dir, options, store)
    }

    /// Writes the host's state to `path` under its lock.
    pub async fn save(&self, path: &Path) -> Result<(), SweepError> {
        let lock = LockedFile::acquire_for(path).await?;
        let record = HostRecord {
            cpus: self.cpus,
            cpus_per_node: self.cpus_per_node,
            base_dir: self.base_dir.clone(),
            fname: self.fname.clone(),
            run_num: self.run_num,
            jobs: self.jobs.iter().cloned().map(JobRecord::from).collect(),
        };
        serde_yaml::to_writer(lock.write_handle()?, &record)?;
        info!(path = %path.display(), jobs = self.jobs.len(), "saved job table");
        Ok(())
    }

    /// Reads a host saved by [`Host::save`], upgrading older job records.
    /// The test program is not saved; attach it again with [`Host::with_program`].
    pub async fn load(path: &Path) -> Result<Self, SweepError> {
        let lock = LockedFile::acquire_for(path).await?;
        let record: HostRecord = serde_yaml::from_reader(lock.read_handle()?)?;
        let jobs = record
            .jobs
            .into_iter()
            .map(JobRecord::upgrade)
            .collect::<Result<Vec<_>, _>>()?;
        let mut host = Host::new(record.cpus, record.cpus_per_node).with_base_dir(record.base_dir);
        host.fname = record.fname;
        host.run_num = record.run_num;
        host.jobs = jobs;
        for job in host.jobs.iter_mut().filter(|job| job.cpus == 0) {
            job.cpus = host.cpus;
        }
        Ok(host)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HostRecord {
    #[serde(default)]
    cpus: usize,
    #[serde(default)]
    cpus_per_node: usize,
    #[serde(default = "current_dir")]
    base_dir: PathBuf,
    #[serde(default)]
    fname: String,
    #[serde(default)]
    run_num: usize,
    jobs: Vec<JobRecord>,
}

fn current_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Parses `[[h:]m:]s` into seconds.
pub fn walltime_to_secs(walltime: &str) -> Result<u64, ConfigError> {
    let parts: Vec<&str> = walltime.split(':').collect();
    if parts.len() > 3 {
        return Err(ConfigError::Walltime(walltime.to_string()));
    }
    parts.iter().try_fold(0u64, |secs, part| {
        part.trim()
            .parse::<u64>()
            .map(|n| secs * 60 + n)
            .map_err(|_| ConfigError::Walltime(walltime.to_string()))
    })
}

/// Formats seconds as `h:mm:ss`.
pub fn secs_to_walltime(secs: u64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}
