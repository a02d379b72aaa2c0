//! CPU-budgeted batch scheduling.
//!
//! [`run_batch`] walks the job table in order and admits every runnable job as
//! soon as the [`Ledger`] has room for it, handing the job to a [`Substrate`]
//! that actually runs it. After the last admission it waits for the running
//! set to drain. An interrupt at any point stops admission, aborts whatever is
//! in flight and puts those jobs back to pending.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use colored::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capacity::{Ledger, Outcome};
use crate::error::{ConfigError, SweepError};
use crate::job::{Job, JobStatus, Work};
use crate::monitor::Monitor;

/// Everything a substrate needs to start one admitted job.
#[derive(Debug, Clone)]
pub struct Launch {
    /// Index into the job table.
    pub job: usize,
    /// 1-based position among the jobs admitted by this run.
    pub ordinal: usize,
    pub work: Work,
    /// Working directory.
    pub dir: PathBuf,
    pub cpus: usize,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Banner lines written at the top of the stdout file.
    pub header: Vec<String>,
    pub dry_run: bool,
}

/// An execution mechanism for admitted jobs.
///
/// `launch` only starts a job. Whoever observes its completion later must call
/// [`Ledger::finish`] exactly once; a `false` return there means some other
/// path already finalized the job.
#[async_trait]
pub trait Substrate: Send + Sync {
    fn name(&self) -> &str;

    /// Rejects a job table this substrate cannot run. Called before anything starts.
    fn check(&self, jobs: &[Job]) -> Result<(), ConfigError>;

    async fn begin(&self) -> Result<(), SweepError> {
        Ok(())
    }

    async fn launch(&self, launch: Launch, ledger: Arc<Ledger>) -> Result<(), SweepError>;

    /// Stops every job still in flight without finalizing it.
    async fn abort(&self, ledger: &Ledger);

    /// Releases per-batch resources once nothing is running.
    async fn finish(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchState {
    #[default]
    Idle,
    Running,
    Complete,
    Interrupted,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Replace every job with one that only reports its ordinal.
    pub dry_run: bool,
    pub verbosity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub state: BatchState,
    /// Most CPUs held at once during the batch.
    pub peak_in_use: usize,
    /// Number of jobs handed to the substrate.
    pub admitted: usize,
}

/// Runs every pending or previously failed job in `jobs` on `substrate`,
/// never holding more than `cpus_per_node` CPUs at once. Job statuses are
/// written back into `jobs` before returning.
pub async fn run_batch(
    jobs: &mut [Job],
    base_dir: &Path,
    cpus_per_node: usize,
    substrate: &dyn Substrate,
    interrupt: &CancellationToken,
    options: RunOptions,
) -> Result<BatchReport, SweepError> {
    if cpus_per_node == 0 {
        return Err(ConfigError::ZeroCapacity("cpus_per_node").into());
    }
    substrate.check(jobs)?;

    let errors = jobs.iter().filter(|job| job.status == JobStatus::Error).count();
    if errors > 0 {
        info!("Previous run had {} errors. Retrying.", errors);
    }
    let runnable = jobs.iter().filter(|job| job.status.is_runnable()).count();

    let ledger = Arc::new(Ledger::new(
        cpus_per_node,
        jobs.iter().map(|job| job.status).collect(),
    ));
    substrate.begin().await?;

    let mut monitor = Monitor::new(options.verbosity, runnable);
    let mut state = BatchState::Running;
    let mut admitted = 0;
    for (index, job) in jobs.iter().enumerate() {
        if !job.status.is_runnable() {
            continue;
        }
        let cpus = job.cpus.clamp(1, cpus_per_node);
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => {
                state = BatchState::Interrupted;
                break;
            }
            _ = ledger.admit(index, cpus) => {}
        }
        admitted += 1;

        let header = monitor.start_job(
            admitted,
            &job.work.to_string(),
            options.dry_run,
            cpus,
            ledger.cpus_free(),
        );
        let launch = Launch {
            job: index,
            ordinal: admitted,
            work: job.work.clone(),
            dir: job.dir.clone().unwrap_or_else(|| base_dir.to_path_buf()),
            cpus,
            stdout: job.stdout_path(base_dir),
            stderr: job.stderr_path(base_dir),
            header,
            dry_run: options.dry_run,
        };
        debug!(job = index, cpus, substrate = substrate.name(), "admitted");
        if let Err(e) = substrate.launch(launch, Arc::clone(&ledger)).await {
            error!(job = index, error = %e, "failed to start job");
            ledger.finish(index, Outcome::Error);
        }
    }

    if state == BatchState::Running {
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => state = BatchState::Interrupted,
            _ = ledger.wait(0) => state = BatchState::Complete,
        }
    }

    if state == BatchState::Interrupted {
        eprintln!("{}", "***INTERRUPT***".red().bold());
        eprintln!("Run again to resume the unfinished jobs.");
        substrate.abort(&ledger).await;
        let reset = ledger.interrupt();
        warn!(jobs = ?reset, "interrupted jobs reset to pending");
    }
    substrate.finish().await;

    for (job, status) in jobs.iter_mut().zip(ledger.statuses()) {
        job.status = status;
    }
    Ok(BatchReport {
        state,
        peak_in_use: ledger.peak_in_use(),
        admitted,
    })
}
