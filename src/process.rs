//! Subprocess substrate: one `sh -c` process per job.
//!
//! Each process gets its own waiter task. When the process exits the waiter
//! appends the elapsed-time record to the job's stderr file, reports failures,
//! and finalizes the job in the ledger. Processes have no timeout.

use std::fs::{self, File};
use std::io::{self, Write};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capacity::{Ledger, Outcome};
use crate::error::{ConfigError, SweepError};
use crate::job::{FailedJob, Job, Work};
use crate::monitor::error_report;
use crate::scheduler::{Launch, Substrate};
use crate::sentinel::{self, Record};

#[derive(Default)]
pub struct ProcessLauncher {
    /// Cancelled to kill every process of the current batch.
    token: Mutex<CancellationToken>,
    waiters: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    async fn join_waiters(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for result in join_all(waiters).await {
            if let Err(e) = result {
                warn!(error = %e, "process waiter task failed");
            }
        }
    }
}

/// The command a dry run executes in place of job `ordinal`.
pub fn dry_run_command(ordinal: usize) -> String {
    let record = Record::new("DRY_RUN", ordinal as i64, "--DRY RUN--");
    format!("echo \"{}\"", record.to_line())
}

/// Exit code of a finished process. A process killed by a signal reports the
/// negated signal number.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    0
}

#[async_trait]
impl Substrate for ProcessLauncher {
    fn name(&self) -> &str {
        "process"
    }

    fn check(&self, jobs: &[Job]) -> Result<(), ConfigError> {
        match jobs
            .iter()
            .position(|job| matches!(job.work, Work::Function { .. }))
        {
            Some(job) => Err(ConfigError::FunctionOnProcess(job)),
            None => Ok(()),
        }
    }

    async fn begin(&self) -> Result<(), SweepError> {
        *self.token.lock() = CancellationToken::new();
        Ok(())
    }

    async fn launch(&self, launch: Launch, ledger: Arc<Ledger>) -> Result<(), SweepError> {
        let command = match (&launch.work, launch.dry_run) {
            (_, true) => dry_run_command(launch.ordinal),
            (Work::Command(cmd), false) => cmd.clone(),
            (Work::Function { .. }, false) => {
                return Err(ConfigError::FunctionOnProcess(launch.job).into())
            }
        };

        let mut stdout = File::create(&launch.stdout)?;
        for line in &launch.header {
            writeln!(stdout, "{}", line)?;
        }
        stdout.flush()?;
        let stderr = File::create(&launch.stderr)?;

        let started = Instant::now();
        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(&command)
            .current_dir(&launch.dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        // Own process group, so an interrupt reaches everything the shell starts.
        #[cfg(unix)]
        process.process_group(0);
        let mut child = process.spawn()?;
        let pid = child.id();
        ledger.set_pid(launch.job, pid);
        debug!(job = launch.job, pid = ?pid, "started process");

        let token = self.token.lock().clone();
        let waiter = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    kill_group(launch.job, pid);
                    if let Err(e) = child.kill().await {
                        warn!(job = launch.job, error = %e, "failed to kill process");
                    }
                    debug!(job = launch.job, "process killed");
                    return;
                }
            };
            complete(&launch, &command, pid, status, started, &ledger);
        });
        self.waiters.lock().push(waiter);
        Ok(())
    }

    async fn abort(&self, _ledger: &Ledger) {
        self.token.lock().cancel();
        self.join_waiters().await;
    }

    async fn finish(&self) {
        self.join_waiters().await;
    }
}

/// Kills the process group led by `pid`.
fn kill_group(job: usize, pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(job, error = %e, "failed to kill process group"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (job, pid);
}

fn complete(
    launch: &Launch,
    command: &str,
    pid: Option<u32>,
    status: io::Result<ExitStatus>,
    started: Instant,
    ledger: &Ledger,
) {
    if !ledger.is_running(launch.job) {
        debug!(job = launch.job, "ignoring completion of a job that is not running");
        return;
    }
    let code = match &status {
        Ok(status) => exit_code(status),
        Err(e) => {
            warn!(job = launch.job, error = %e, "failed to wait for process");
            1
        }
    };
    let outcome = if code > 0 {
        Outcome::Error
    } else {
        Outcome::Finished
    };

    let elapsed = started.elapsed().as_secs_f64();
    if let Err(e) = sentinel::append(&launch.stderr, &Record::time(elapsed)) {
        warn!(job = launch.job, error = %e, "failed to record elapsed time");
    }
    if outcome == Outcome::Error {
        let failed = FailedJob {
            job: launch.job,
            pid,
            work: command.to_string(),
            cause: format!("returned {}", code),
        };
        let stderr_text = fs::read_to_string(&launch.stderr).unwrap_or_default();
        error_report(&failed, &stderr_text, &launch.stdout.with_extension(""));
    }

    if !ledger.finish(launch.job, outcome) {
        debug!(job = launch.job, "job was already finalized");
    }
}
