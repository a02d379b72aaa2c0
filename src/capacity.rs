//! CPU budget and running-set bookkeeping.
//!
//! The [`Ledger`] holds the free CPU count, the set of running jobs and every
//! job's status behind one lock. Admission and release each change the free
//! count and the running set together, so no observer ever sees one without
//! the other. Completion handlers may live on tokio tasks or on plain worker
//! threads; the lock is never held across an await.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::job::JobStatus;

/// Upper bound on how long a waiter sleeps between capacity checks.
///
/// Releases wake waiters immediately; the poll is a backstop so that the
/// latency of noticing freed capacity is bounded by this interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Error,
}

impl From<Outcome> for JobStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Finished => JobStatus::Finished,
            Outcome::Error => JobStatus::Error,
        }
    }
}

#[derive(Debug)]
struct RunningJob {
    cpus: usize,
    pid: Option<u32>,
}

#[derive(Debug)]
struct LedgerState {
    /// Total capacity. Fixed for the ledger's lifetime.
    cpus_per_node: usize,
    cpus_free: usize,
    running: BTreeMap<usize, RunningJob>,
    statuses: Vec<JobStatus>,
    /// Most CPUs ever held at once.
    peak_in_use: usize,
}

impl LedgerState {
    fn in_use(&self) -> usize {
        self.cpus_per_node - self.cpus_free
    }
}

/// Shared capacity state for one batch.
#[derive(Debug)]
pub struct Ledger {
    state: Mutex<LedgerState>,
    released: Notify,
}

impl Ledger {
    /// Creates a ledger at full capacity with nothing running.
    pub fn new(cpus_per_node: usize, statuses: Vec<JobStatus>) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                cpus_per_node,
                cpus_free: cpus_per_node,
                running: BTreeMap::new(),
                statuses,
                peak_in_use: 0,
            }),
            released: Notify::new(),
        }
    }

    pub fn cpus_per_node(&self) -> usize {
        self.state.lock().cpus_per_node
    }

    pub fn cpus_free(&self) -> usize {
        self.state.lock().cpus_free
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn running_jobs(&self) -> Vec<usize> {
        self.state.lock().running.keys().copied().collect()
    }

    pub fn is_running(&self, job: usize) -> bool {
        self.state.lock().running.contains_key(&job)
    }

    pub fn peak_in_use(&self) -> usize {
        self.state.lock().peak_in_use
    }

    pub fn status(&self, job: usize) -> JobStatus {
        self.state.lock().statuses[job]
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.state.lock().statuses.clone()
    }

    /// Admits `job` if `cpus` are free. Returns whether it was admitted.
    pub fn try_admit(&self, job: usize, cpus: usize) -> bool {
        let mut state = self.state.lock();
        debug_assert!(cpus <= state.cpus_per_node);
        if state.cpus_free < cpus || state.running.contains_key(&job) {
            return false;
        }
        state.cpus_free -= cpus;
        state.running.insert(job, RunningJob { cpus, pid: None });
        state.statuses[job] = JobStatus::Running;
        state.peak_in_use = state.peak_in_use.max(state.in_use());
        true
    }

    /// Waits for capacity, then admits `job`.
    pub async fn admit(&self, job: usize, cpus: usize) {
        loop {
            self.wait(cpus).await;
            if self.try_admit(job, cpus) {
                return;
            }
        }
    }

    /// Records the OS process backing a running job.
    pub fn set_pid(&self, job: usize, pid: Option<u32>) {
        if let Some(entry) = self.state.lock().running.get_mut(&job) {
            entry.pid = pid;
        }
    }

    pub fn pid(&self, job: usize) -> Option<u32> {
        self.state.lock().running.get(&job).and_then(|entry| entry.pid)
    }

    /// Waits until at least `cpus` are free, or with `cpus == 0` until nothing runs.
    ///
    /// Also returns once nothing is running, since no later release can follow.
    pub async fn wait(&self, cpus: usize) {
        loop {
            let released = self.released.notified();
            {
                let state = self.state.lock();
                if state.running.is_empty() || (cpus > 0 && state.cpus_free >= cpus) {
                    return;
                }
            }
            tokio::select! {
                _ = released => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Finalizes a running job: releases its CPUs, drops it from the running
    /// set and records its terminal status, all in one critical section.
    ///
    /// Returns `false` if the job was not running, in which case nothing changes.
    pub fn finish(&self, job: usize, outcome: Outcome) -> bool {
        {
            let mut state = self.state.lock();
            let Some(entry) = state.running.remove(&job) else {
                return false;
            };
            state.cpus_free += entry.cpus;
            debug_assert!(state.cpus_free <= state.cpus_per_node);
            state.statuses[job] = outcome.into();
        }
        self.released.notify_waiters();
        true
    }

    /// Drops every running job back to pending and restores their CPUs.
    /// Returns the jobs that were reset.
    pub fn interrupt(&self) -> Vec<usize> {
        let reset = {
            let mut state = self.state.lock();
            let running = std::mem::take(&mut state.running);
            for (&job, entry) in running.iter() {
                state.cpus_free += entry.cpus;
                state.statuses[job] = JobStatus::Pending;
            }
            running.into_keys().collect()
        };
        self.released.notify_waiters();
        reset
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    fn ledger(cpus: usize, jobs: usize) -> Ledger {
        Ledger::new(cpus, vec![JobStatus::Pending; jobs])
    }

    #[test]
    fn test_admit_single_cpu() {
        let ledger = ledger(8, 2);
        assert!(ledger.try_admit(0, 1));
        assert_eq!(ledger.cpus_free(), 7);
        assert_eq!(ledger.status(0), JobStatus::Running);
        assert_eq!(ledger.running_jobs(), vec![0]);
    }

    #[test]
    fn test_admit_insufficient_cpus() {
        let ledger = ledger(4, 2);
        assert!(ledger.try_admit(0, 3));
        assert!(!ledger.try_admit(1, 2));
        assert_eq!(ledger.cpus_free(), 1);
        assert_eq!(ledger.status(1), JobStatus::Pending);
    }

    #[test]
    fn test_admit_same_job_twice() {
        let ledger = ledger(4, 1);
        assert!(ledger.try_admit(0, 1));
        assert!(!ledger.try_admit(0, 1));
        assert_eq!(ledger.cpus_free(), 3);
    }

    #[test]
    fn test_finish_releases_once() {
        let ledger = ledger(4, 1);
        ledger.try_admit(0, 4);
        assert!(ledger.finish(0, Outcome::Error));
        assert_eq!(ledger.cpus_free(), 4);
        assert_eq!(ledger.status(0), JobStatus::Error);
        // A second completion signal for the same job is stale.
        assert!(!ledger.finish(0, Outcome::Finished));
        assert_eq!(ledger.cpus_free(), 4);
        assert_eq!(ledger.status(0), JobStatus::Error);
    }

    #[test]
    fn test_interrupt_resets_running_only() {
        let ledger = ledger(4, 3);
        ledger.try_admit(0, 1);
        ledger.try_admit(1, 2);
        ledger.finish(0, Outcome::Finished);
        ledger.try_admit(2, 1);
        let mut reset = ledger.interrupt();
        reset.sort();
        assert_eq!(reset, vec![1, 2]);
        assert_eq!(ledger.cpus_free(), 4);
        assert_eq!(
            ledger.statuses(),
            vec![JobStatus::Finished, JobStatus::Pending, JobStatus::Pending]
        );
    }

    #[test]
    fn test_peak_in_use() {
        let ledger = ledger(8, 3);
        ledger.try_admit(0, 2);
        ledger.try_admit(1, 4);
        ledger.finish(0, Outcome::Finished);
        ledger.try_admit(2, 1);
        assert_eq!(ledger.peak_in_use(), 6);
    }

    #[test]
    fn test_pid_tracking() {
        let ledger = ledger(2, 1);
        ledger.set_pid(0, Some(42));
        assert_eq!(ledger.pid(0), None);
        ledger.try_admit(0, 1);
        ledger.set_pid(0, Some(42));
        assert_eq!(ledger.pid(0), Some(42));
    }

    #[tokio::test]
    async fn test_wait_returns_when_idle() {
        let ledger = ledger(2, 1);
        ledger.wait(0).await;
        ledger.wait(2).await;
    }

    #[tokio::test]
    async fn test_wait_wakes_on_release() {
        let ledger = Arc::new(ledger(1, 2));
        ledger.try_admit(0, 1);
        let releaser = Arc::clone(&ledger);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.finish(0, Outcome::Finished);
        });
        let start = Instant::now();
        ledger.admit(1, 1).await;
        assert!(start.elapsed() < POLL_INTERVAL * 5);
        assert_eq!(ledger.status(1), JobStatus::Running);
        assert_eq!(ledger.cpus_free(), 0);
    }

    #[tokio::test]
    async fn test_wait_zero_drains() {
        let ledger = Arc::new(ledger(4, 2));
        ledger.try_admit(0, 1);
        ledger.try_admit(1, 1);
        let releaser = Arc::clone(&ledger);
        tokio::spawn(async move {
            releaser.finish(0, Outcome::Finished);
            tokio::time::sleep(Duration::from_millis(10)).await;
            releaser.finish(1, Outcome::Error);
        });
        ledger.wait(0).await;
        assert_eq!(ledger.running_count(), 0);
        assert_eq!(ledger.cpus_free(), 4);
    }
}
