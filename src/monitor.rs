//! Operator-facing console output: job banners, progress and error reports.

use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use colored::*;
use tracing::error;

use crate::job::FailedJob;
use crate::sentinel;

/// Minimum time between two progress counter refreshes.
const PROGRESS_PERIOD: Duration = Duration::from_millis(500);
/// How many trailing stderr lines an error report shows.
const REPORT_TAIL: usize = 20;

pub struct Monitor {
    verbosity: u8,
    total: usize,
    last_progress: Option<Instant>,
}

impl Monitor {
    pub fn new(verbosity: u8, total: usize) -> Self {
        Self {
            verbosity,
            total,
            last_progress: None,
        }
    }

    /// Announces job `ordinal` (1-based) and returns the banner lines that
    /// head its `.out` file.
    pub fn start_job(
        &mut self,
        ordinal: usize,
        description: &str,
        dry_run: bool,
        cpus: usize,
        cpus_free: usize,
    ) -> Vec<String> {
        let mut title = format!("Job {} of {}", ordinal, self.total);
        if dry_run {
            title.push_str(" --DRY RUN--");
        }
        let header = vec![
            format!("{}  {}", title, chrono::Local::now().format("%a %b %e %H:%M:%S %Y")),
            format!("CPUs provisioned: {}, {} remain free", cpus, cpus_free),
            String::new(),
            description.to_string(),
        ];

        if self.verbosity >= 2 {
            let border = "=".repeat(79);
            println!("{}", border.blue());
            for line in &header {
                println!("{}", line);
            }
            println!("{}", border.blue());
        } else {
            let due = self
                .last_progress
                .map_or(true, |at| at.elapsed() >= PROGRESS_PERIOD);
            if due || ordinal == self.total {
                print!("\r{}/{}", ordinal, self.total);
                let _ = std::io::stdout().flush();
                self.last_progress = Some(Instant::now());
            }
            if ordinal == self.total {
                println!();
            }
        }
        header
    }
}

/// Prints a report for a job that ended in error: its command, exit code and
/// the tail of its stderr, minus the elapsed-time record.
pub fn error_report(failed: &FailedJob, stderr_text: &str, outfile: &Path) {
    let border = "*".repeat(40);
    let tail = report_tail(stderr_text);

    error!(job = failed.job, pid = ?failed.pid, "{}", failed.cause);
    let mut report = String::new();
    report.push_str(&border);
    report.push('\n');
    match failed.pid {
        Some(pid) => report.push_str(&format!("ERROR (pid {}): {} {}\n", pid, failed.work, failed.cause)),
        None => report.push_str(&format!("ERROR: {} {}\n", failed.work, failed.cause)),
    }
    for line in &tail {
        report.push_str(line);
        report.push('\n');
    }
    report.push_str(&format!(
        "Output is in {}.out and {}.err\n",
        outfile.display(),
        outfile.display()
    ));
    report.push_str(&border);
    eprintln!("{}", report.red());
}

/// The last stderr lines worth showing. Sentinel records are not.
fn report_tail(stderr_text: &str) -> Vec<&str> {
    let lines: Vec<&str> = stderr_text
        .lines()
        .filter(|line| !line.starts_with(sentinel::OPEN))
        .collect();
    lines[lines.len().saturating_sub(REPORT_TAIL)..].to_vec()
}
