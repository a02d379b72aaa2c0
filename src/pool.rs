//! Pooled substrate: jobs are calls to one in-process function, run on a
//! fixed set of worker threads.
//!
//! A submission can complete two ways. When the function returns normally the
//! worker hands the result to the pool's callback-dispatch thread, which runs
//! the submission's success callback (path A) before resolving its
//! [`AsyncResult`]. When the function fails, panics or never returns, no
//! callback runs; instead the per-submission watchdog notices the failed or
//! overdue result (path B). Both paths go through one [`Finalizer`] whose
//! `finalized` flag is swapped atomically, so exactly one of them acts.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::capacity::{Ledger, Outcome};
use crate::error::{ConfigError, SweepError};
use crate::job::{FailedJob, Job, Work};
use crate::monitor::error_report;
use crate::scheduler::{Launch, Substrate};
use crate::sentinel::{self, Record, Value};

/// How long a watchdog waits for a submission before failing it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

/// The small record a job function returns. Each entry is reported as a
/// sentinel record on the job's stdout.
pub type JobMeta = BTreeMap<String, Value>;
pub type JobFnResult = Result<JobMeta, Box<dyn std::error::Error + Send + Sync>>;

/// What a job function sees of its job.
pub struct JobContext {
    job: usize,
    args: String,
    dir: PathBuf,
    stdout: BufWriter<File>,
    stderr: BufWriter<File>,
}

impl JobContext {
    fn open(launch: &Launch, args: String) -> io::Result<Self> {
        let mut stdout = BufWriter::new(truncate_for_append(&launch.stdout)?);
        for line in &launch.header {
            writeln!(stdout, "{}", line)?;
        }
        let stderr = BufWriter::new(truncate_for_append(&launch.stderr)?);
        Ok(Self {
            job: launch.job,
            args,
            dir: launch.dir.clone(),
            stdout,
            stderr,
        })
    }

    pub fn job(&self) -> usize {
        self.job
    }

    /// The rendered argument string, e.g. `--x=1.5 --y=2.0`.
    pub fn args(&self) -> &str {
        &self.args
    }

    /// The job's working directory. Worker threads share the process's
    /// current directory, so relative paths should go through [`JobContext::path`].
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.join(name)
    }

    pub fn stdout(&mut self) -> &mut impl Write {
        &mut self.stdout
    }

    pub fn stderr(&mut self) -> &mut impl Write {
        &mut self.stderr
    }

    /// Reports a named result on the job's stdout.
    pub fn emit(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
        desc: impl Into<String>,
    ) -> io::Result<()> {
        writeln!(self.stdout, "{}", Record::new(name, value, desc).to_line())
    }

    fn close(mut self) -> io::Result<()> {
        self.stdout.flush()?;
        self.stderr.flush()
    }
}

/// Empties `path` and opens it for appending. A watchdog may append to the
/// same file while the function still runs, and neither write may clobber
/// the other.
fn truncate_for_append(path: &Path) -> io::Result<File> {
    File::create(path)?;
    OpenOptions::new().append(true).open(path)
}

/// A named function every job of a pooled host calls.
#[derive(Clone)]
pub struct JobFunction {
    name: String,
    func: Arc<dyn Fn(&mut JobContext) -> JobFnResult + Send + Sync>,
}

impl JobFunction {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&mut JobContext) -> JobFnResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, ctx: &mut JobContext) -> JobFnResult {
        (self.func)(ctx)
    }
}

impl fmt::Debug for JobFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobFunction({})", self.name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("raised: {0}")]
    Raised(String),
    #[error("panicked: {0}")]
    Panicked(String),
    /// The job reached a terminal state before a worker picked it up.
    #[error("skipped: job already finalized")]
    Skipped,
}

type Task = Box<dyn FnOnce() -> Result<JobMeta, TaskFailure> + Send>;
type SuccessCallback = Box<dyn FnOnce(&JobMeta) + Send>;
type ResultSender = oneshot::Sender<Result<JobMeta, TaskFailure>>;

struct Submission {
    task: Task,
    on_success: SuccessCallback,
    result: ResultSender,
}

struct Callback {
    meta: JobMeta,
    on_success: SuccessCallback,
    result: ResultSender,
}

/// A fixed set of worker threads fed by one queue, plus one thread that runs
/// success callbacks in completion order.
pub struct WorkerPool {
    size: usize,
    queue: Mutex<Option<flume::Sender<Submission>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
    terminated: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, SweepError> {
        if size == 0 {
            return Err(ConfigError::ZeroCapacity("workers").into());
        }
        let terminated = Arc::new(AtomicBool::new(false));
        let (queue_tx, queue_rx) = flume::unbounded::<Submission>();
        let (callback_tx, callback_rx) = flume::unbounded::<Callback>();

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let queue_rx = queue_rx.clone();
            let callback_tx = callback_tx.clone();
            let terminated = Arc::clone(&terminated);
            workers.push(
                thread::Builder::new()
                    .name(format!("uqsweep-worker-{}", i))
                    .spawn(move || work(queue_rx, callback_tx, terminated))?,
            );
        }
        let dispatcher = {
            let terminated = Arc::clone(&terminated);
            thread::Builder::new()
                .name("uqsweep-callbacks".to_string())
                .spawn(move || dispatch(callback_rx, terminated))?
        };

        Ok(Self {
            size,
            queue: Mutex::new(Some(queue_tx)),
            workers: Mutex::new(workers),
            dispatcher: Mutex::new(Some(dispatcher)),
            terminated,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `task`. `on_success` runs on the dispatch thread with the task's
    /// result, before the returned handle resolves. It never runs for a task
    /// that fails or panics.
    pub fn submit(
        &self,
        task: impl FnOnce() -> Result<JobMeta, TaskFailure> + Send + 'static,
        on_success: impl FnOnce(&JobMeta) + Send + 'static,
    ) -> Result<AsyncResult, SweepError> {
        let (result, rx) = oneshot::channel();
        let queue = self.queue.lock();
        let sender = queue.as_ref().ok_or(SweepError::PoolClosed)?;
        sender
            .send(Submission {
                task: Box::new(task),
                on_success: Box::new(on_success),
                result,
            })
            .map_err(|_| SweepError::PoolClosed)?;
        Ok(AsyncResult { rx })
    }

    /// Stops accepting submissions. Queued ones still run.
    pub fn close(&self) {
        self.queue.lock().take();
    }

    /// Stops accepting submissions and drops the queued ones. Calls already
    /// running are abandoned: they finish on their own but nothing observes them.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.close();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Blocks until every worker and the dispatcher exit. Only returns once
    /// the pool is closed and its queue has drained.
    pub fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if dispatcher.join().is_err() {
                warn!("callback thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn work(
    queue: flume::Receiver<Submission>,
    callbacks: flume::Sender<Callback>,
    terminated: Arc<AtomicBool>,
) {
    while let Ok(Submission {
        task,
        on_success,
        result,
    }) = queue.recv()
    {
        if terminated.load(Ordering::Acquire) {
            continue;
        }
        let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(outcome) => outcome,
            Err(payload) => Err(TaskFailure::Panicked(panic_message(&*payload))),
        };
        match outcome {
            Ok(meta) => {
                // A closed dispatcher drops `result`, which the watchdog sees as abandoned.
                let _ = callbacks.send(Callback {
                    meta,
                    on_success,
                    result,
                });
            }
            Err(failure) => {
                let _ = result.send(Err(failure));
            }
        }
    }
}

fn dispatch(callbacks: flume::Receiver<Callback>, terminated: Arc<AtomicBool>) {
    while let Ok(Callback {
        meta,
        on_success,
        result,
    }) = callbacks.recv()
    {
        if !terminated.load(Ordering::Acquire) {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_success(&meta))) {
                warn!(panic = %panic_message(&*payload), "success callback panicked");
            }
        }
        let _ = result.send(Ok(meta));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to one submission's result.
pub struct AsyncResult {
    rx: oneshot::Receiver<Result<JobMeta, TaskFailure>>,
}

#[derive(Debug, PartialEq)]
pub enum Resolution {
    Succeeded(JobMeta),
    Failed(TaskFailure),
    TimedOut,
    /// The pool dropped the submission without running it to completion.
    Abandoned,
}

impl AsyncResult {
    pub async fn resolve(self, timeout: Duration) -> Resolution {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(Ok(meta))) => Resolution::Succeeded(meta),
            Ok(Ok(Err(failure))) => Resolution::Failed(failure),
            Ok(Err(_)) => Resolution::Abandoned,
            Err(_) => Resolution::TimedOut,
        }
    }
}

static POOL_IN_USE: AtomicBool = AtomicBool::new(false);

/// Held by the one pooled launcher allowed to have jobs outstanding.
#[derive(Debug)]
pub struct PoolLease(());

impl PoolLease {
    pub fn acquire() -> Result<Self, ConfigError> {
        POOL_IN_USE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| PoolLease(()))
            .map_err(|_| ConfigError::PoolInUse)
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        POOL_IN_USE.store(false, Ordering::Release);
    }
}

/// The single place a pooled submission reaches its terminal state.
struct Finalizer {
    job: usize,
    work: String,
    stdout: PathBuf,
    stderr: PathBuf,
    started: Instant,
    ledger: Arc<Ledger>,
    finalized: AtomicBool,
}

impl Finalizer {
    fn new(launch: &Launch, ledger: Arc<Ledger>) -> Self {
        Self {
            job: launch.job,
            work: launch.work.to_string(),
            stdout: launch.stdout.clone(),
            stderr: launch.stderr.clone(),
            started: Instant::now(),
            ledger,
            finalized: AtomicBool::new(false),
        }
    }

    /// True for exactly one caller.
    fn claim(&self) -> bool {
        !self.finalized.swap(true, Ordering::AcqRel)
    }

    fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Path A.
    fn succeed(&self, meta: &JobMeta) {
        if !self.claim() {
            debug!(job = self.job, "late success ignored");
            return;
        }
        match self.record(meta) {
            Ok(()) => {
                self.ledger.finish(self.job, Outcome::Finished);
            }
            Err(e) => self.report(&format!("failed to record result: {}", e)),
        }
    }

    /// Path B.
    fn fail(&self, cause: &str) {
        if !self.claim() {
            debug!(job = self.job, cause, "job already finalized");
            return;
        }
        self.report(cause);
    }

    fn record(&self, meta: &JobMeta) -> io::Result<()> {
        if !meta.is_empty() {
            let mut out = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.stdout)?;
            for (name, value) in meta {
                writeln!(out, "{}", Record::new(name.as_str(), value.clone(), "").to_line())?;
            }
        }
        sentinel::append(&self.stderr, &Record::time(self.elapsed()))
    }

    fn report(&self, cause: &str) {
        let written = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.stderr)
            .and_then(|mut f| writeln!(f, "{}", cause))
            .and_then(|_| sentinel::append(&self.stderr, &Record::time(self.elapsed())));
        if let Err(e) = written {
            warn!(job = self.job, error = %e, "failed to write job stderr");
        }
        let failed = FailedJob {
            job: self.job,
            pid: None,
            work: self.work.clone(),
            cause: cause.to_string(),
        };
        let stderr_text = fs::read_to_string(&self.stderr).unwrap_or_default();
        error_report(&failed, &stderr_text, &self.stdout.with_extension(""));
        self.ledger.finish(self.job, Outcome::Error);
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Runs on a worker thread.
fn run_function(
    function: &JobFunction,
    launch: &Launch,
    args: String,
) -> Result<JobMeta, TaskFailure> {
    let mut ctx = JobContext::open(launch, args)
        .map_err(|e| TaskFailure::Raised(format!("failed to open job files: {}", e)))?;
    let result = if launch.dry_run {
        ctx.emit("DRY_RUN", launch.ordinal as i64, "--DRY RUN--")
            .map(|_| JobMeta::new())
            .map_err(Into::into)
    } else {
        match panic::catch_unwind(AssertUnwindSafe(|| function.call(&mut ctx))) {
            Ok(result) => result,
            Err(payload) => return Err(TaskFailure::Panicked(panic_message(&*payload))),
        }
    };
    ctx.close()
        .map_err(|e| TaskFailure::Raised(format!("failed to write job files: {}", e)))?;
    result.map_err(|e| TaskFailure::Raised(e.to_string()))
}

enum PoolSource {
    /// A fresh pool of this many workers per batch, closed when the batch ends.
    Owned { workers: usize },
    /// A caller-owned pool that is never closed here.
    External(Arc<WorkerPool>),
}

struct Batch {
    pool: Arc<WorkerPool>,
    inflight: Vec<(Arc<Finalizer>, JoinHandle<()>)>,
    /// Set when a watchdog gave up on a submission, whose worker may never
    /// come back.
    stalled: Arc<AtomicBool>,
    _lease: PoolLease,
}

pub struct PooledLauncher {
    function: JobFunction,
    source: PoolSource,
    timeout: Duration,
    batch: Mutex<Option<Batch>>,
}

impl PooledLauncher {
    /// A launcher that creates its own pool of `workers` threads for each batch.
    pub fn new(function: JobFunction, workers: usize) -> Self {
        Self {
            function,
            source: PoolSource::Owned { workers },
            timeout: DEFAULT_TIMEOUT,
            batch: Mutex::new(None),
        }
    }

    /// A launcher that submits to `pool` and leaves it open.
    pub fn with_pool(function: JobFunction, pool: Arc<WorkerPool>) -> Self {
        Self {
            function,
            source: PoolSource::External(pool),
            timeout: DEFAULT_TIMEOUT,
            batch: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn function(&self) -> &JobFunction {
        &self.function
    }

    async fn join_watchdogs(inflight: Vec<(Arc<Finalizer>, JoinHandle<()>)>) {
        for (_, watchdog) in inflight {
            if let Err(e) = watchdog.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "watchdog task failed");
                }
            }
        }
    }
}

#[async_trait]
impl Substrate for PooledLauncher {
    fn name(&self) -> &str {
        "pool"
    }

    fn check(&self, jobs: &[Job]) -> Result<(), ConfigError> {
        for (index, job) in jobs.iter().enumerate() {
            match &job.work {
                Work::Command(_) => return Err(ConfigError::CommandOnPool(index)),
                Work::Function { function, .. } if function != self.function.name() => {
                    return Err(ConfigError::FunctionMismatch {
                        job: index,
                        expected: self.function.name().to_string(),
                        found: function.clone(),
                    })
                }
                Work::Function { .. } => {}
            }
        }
        Ok(())
    }

    async fn begin(&self) -> Result<(), SweepError> {
        let lease = PoolLease::acquire()?;
        let pool = match &self.source {
            PoolSource::Owned { workers } => Arc::new(WorkerPool::new(*workers)?),
            PoolSource::External(pool) => Arc::clone(pool),
        };
        *self.batch.lock() = Some(Batch {
            pool,
            inflight: vec![],
            stalled: Arc::new(AtomicBool::new(false)),
            _lease: lease,
        });
        Ok(())
    }

    async fn launch(&self, launch: Launch, ledger: Arc<Ledger>) -> Result<(), SweepError> {
        let args = match &launch.work {
            Work::Function { function, args } if function == self.function.name() => args.clone(),
            Work::Function { function, .. } => {
                return Err(ConfigError::FunctionMismatch {
                    job: launch.job,
                    expected: self.function.name().to_string(),
                    found: function.clone(),
                }
                .into())
            }
            Work::Command(_) => return Err(ConfigError::CommandOnPool(launch.job).into()),
        };
        let (pool, stalled) = self
            .batch
            .lock()
            .as_ref()
            .map(|batch| (Arc::clone(&batch.pool), Arc::clone(&batch.stalled)))
            .ok_or(SweepError::PoolClosed)?;

        let finalizer = Arc::new(Finalizer::new(&launch, ledger));
        let task = {
            let function = self.function.clone();
            let finalizer = Arc::clone(&finalizer);
            move || {
                if finalizer.is_finalized() {
                    debug!(job = launch.job, "job already finalized, not running it");
                    return Err(TaskFailure::Skipped);
                }
                run_function(&function, &launch, args)
            }
        };
        let on_success = {
            let finalizer = Arc::clone(&finalizer);
            move |meta: &JobMeta| finalizer.succeed(meta)
        };
        let handle = pool.submit(task, on_success)?;

        let timeout = self.timeout;
        let watchdog = {
            let finalizer = Arc::clone(&finalizer);
            tokio::spawn(async move {
                match handle.resolve(timeout).await {
                    Resolution::Succeeded(_) => {}
                    Resolution::Failed(failure) => finalizer.fail(&failure.to_string()),
                    Resolution::TimedOut => {
                        stalled.store(true, Ordering::Release);
                        finalizer.fail(&format!("timed out after {} seconds", timeout.as_secs_f64()))
                    }
                    Resolution::Abandoned => {
                        stalled.store(true, Ordering::Release);
                        finalizer.fail("abandoned by the worker pool")
                    }
                }
            })
        };
        if let Some(batch) = self.batch.lock().as_mut() {
            batch.inflight.push((finalizer, watchdog));
        }
        Ok(())
    }

    async fn abort(&self, _ledger: &Ledger) {
        let batch = self.batch.lock().take();
        let Some(batch) = batch else {
            return;
        };
        for (finalizer, watchdog) in &batch.inflight {
            finalizer.claim();
            watchdog.abort();
        }
        if let PoolSource::Owned { .. } = self.source {
            batch.pool.terminate();
        }
        Self::join_watchdogs(batch.inflight).await;
    }

    async fn finish(&self) {
        let batch = self.batch.lock().take();
        let Some(batch) = batch else {
            return;
        };
        Self::join_watchdogs(batch.inflight).await;
        if let PoolSource::Owned { .. } = self.source {
            let pool = batch.pool;
            if batch.stalled.load(Ordering::Acquire) {
                // Joining would wait on a function that may never return.
                warn!("a job function did not return in time; leaving its worker behind");
                pool.terminate();
                return;
            }
            pool.close();
            if !pool.is_terminated() {
                let joined = tokio::task::spawn_blocking(move || pool.join()).await;
                if let Err(e) = joined {
                    warn!(error = %e, "failed to join worker pool");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::job::JobStatus;
    use crate::scheduler::{run_batch, BatchState, RunOptions};

    /// Pooled launchers hold a process-wide lease, so their tests take turns.
    static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    fn ok_task() -> Result<JobMeta, TaskFailure> {
        Ok(JobMeta::new())
    }

    #[tokio::test]
    async fn test_callback_runs_before_result_resolves() {
        let pool = WorkerPool::new(2).unwrap();
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let handle = pool
            .submit(
                || {
                    let mut meta = JobMeta::new();
                    meta.insert("y".to_string(), Value::Float(2.5));
                    Ok(meta)
                },
                move |_| flag.store(true, Ordering::SeqCst),
            )
            .unwrap();
        match handle.resolve(Duration::from_secs(5)).await {
            Resolution::Succeeded(meta) => assert_eq!(meta["y"], Value::Float(2.5)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_skips_callback() {
        let pool = WorkerPool::new(1).unwrap();
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let handle = pool
            .submit(
                || Err(TaskFailure::Raised("bad input".to_string())),
                move |_| flag.store(true, Ordering::SeqCst),
            )
            .unwrap();
        assert_eq!(
            handle.resolve(Duration::from_secs(5)).await,
            Resolution::Failed(TaskFailure::Raised("bad input".to_string()))
        );
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_keeps_worker_alive() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.submit(|| panic!("boom"), |_| {}).unwrap();
        assert_eq!(
            handle.resolve(Duration::from_secs(5)).await,
            Resolution::Failed(TaskFailure::Panicked("boom".to_string()))
        );
        let handle = pool.submit(ok_task, |_| {}).unwrap();
        assert_eq!(
            handle.resolve(Duration::from_secs(5)).await,
            Resolution::Succeeded(JobMeta::new())
        );
    }

    #[tokio::test]
    async fn test_timeout() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool
            .submit(
                || {
                    thread::sleep(Duration::from_millis(300));
                    ok_task()
                },
                |_| {},
            )
            .unwrap();
        assert_eq!(
            handle.resolve(Duration::from_millis(20)).await,
            Resolution::TimedOut
        );
    }

    #[tokio::test]
    async fn test_terminate_abandons_queued() {
        let pool = WorkerPool::new(1).unwrap();
        let _running = pool
            .submit(
                || {
                    thread::sleep(Duration::from_millis(200));
                    ok_task()
                },
                |_| {},
            )
            .unwrap();
        let queued = pool.submit(ok_task, |_| {}).unwrap();
        pool.terminate();
        assert_eq!(
            queued.resolve(Duration::from_secs(5)).await,
            Resolution::Abandoned
        );
        assert!(matches!(pool.submit(ok_task, |_| {}), Err(SweepError::PoolClosed)));
    }

    #[test]
    fn test_zero_workers() {
        assert!(matches!(
            WorkerPool::new(0),
            Err(SweepError::Config(ConfigError::ZeroCapacity("workers")))
        ));
    }

    #[tokio::test]
    async fn test_single_lease() {
        let _serial = SERIAL.lock().await;
        let lease = PoolLease::acquire().unwrap();
        assert_eq!(PoolLease::acquire().unwrap_err(), ConfigError::PoolInUse);
        drop(lease);
        PoolLease::acquire().unwrap();
    }

    fn function_jobs(args: &[&str]) -> Vec<Job> {
        args.iter()
            .enumerate()
            .map(|(i, args)| {
                Job::new(
                    Work::Function {
                        function: "model".to_string(),
                        args: args.to_string(),
                    },
                    None,
                    1,
                    format!("model_{}", i),
                )
            })
            .collect()
    }

    fn model() -> JobFunction {
        JobFunction::new("model", |ctx| {
            if ctx.args().contains("bad") {
                return Err(format!("cannot evaluate {}", ctx.args()).into());
            }
            if ctx.args().contains("slow") {
                thread::sleep(Duration::from_millis(400));
            }
            ctx.emit("f", 1.25, "model output")?;
            Ok(JobMeta::new())
        })
    }

    async fn run(launcher: &PooledLauncher, jobs: &mut [Job], dir: &Path) -> BatchState {
        run_batch(
            jobs,
            dir,
            2,
            launcher,
            &CancellationToken::new(),
            RunOptions::default(),
        )
        .await
        .unwrap()
        .state
    }

    #[tokio::test]
    async fn test_pooled_batch() {
        let _serial = SERIAL.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let launcher = PooledLauncher::new(model(), 2);
        let mut jobs = function_jobs(&["--x=1", "--x=bad", "--x=3"]);
        assert_eq!(run(&launcher, &mut jobs, dir.path()).await, BatchState::Complete);
        let statuses: Vec<_> = jobs.iter().map(|job| job.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Finished, JobStatus::Error, JobStatus::Finished]
        );

        let out = fs::read_to_string(dir.path().join("model_0.out")).unwrap();
        assert_eq!(sentinel::records(&out), vec![Record::new("f", 1.25, "model output")]);
        let err = fs::read_to_string(dir.path().join("model_1.err")).unwrap();
        assert!(err.contains("raised: cannot evaluate --x=bad"));
        assert!(sentinel::has_marker(&err));
        // The lease is released once the batch is over.
        PoolLease::acquire().unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_timeout_finalizes_once() {
        let _serial = SERIAL.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let function = JobFunction::new("model", move |_ctx| {
            thread::sleep(Duration::from_millis(300));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(JobMeta::new())
        });
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let launcher =
            PooledLauncher::with_pool(function, Arc::clone(&pool)).with_timeout(Duration::from_millis(50));
        let mut jobs = function_jobs(&["--x=1"]);
        assert_eq!(run(&launcher, &mut jobs, dir.path()).await, BatchState::Complete);
        assert_eq!(jobs[0].status, JobStatus::Error);

        // The late success reaches the callback but does not finalize again.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        let err = fs::read_to_string(dir.path().join("model_0.err")).unwrap();
        assert_eq!(sentinel::records(&err).len(), 1);
        // An external pool stays open.
        assert!(pool.submit(ok_task, |_| {}).is_ok());
    }

    #[tokio::test]
    async fn test_hung_function_does_not_hold_up_the_batch() {
        let _serial = SERIAL.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let function = JobFunction::new("model", |_ctx| {
            thread::sleep(Duration::from_secs(3));
            Ok(JobMeta::new())
        });
        let launcher = PooledLauncher::new(function, 1).with_timeout(Duration::from_millis(100));
        let mut jobs = function_jobs(&["--x=1"]);

        let started = Instant::now();
        assert_eq!(run(&launcher, &mut jobs, dir.path()).await, BatchState::Complete);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(jobs[0].status, JobStatus::Error);
        let err = fs::read_to_string(dir.path().join("model_0.err")).unwrap();
        assert!(err.contains("timed out after 0.1 seconds"));
    }

    #[tokio::test]
    async fn test_queued_job_finalized_by_watchdog_never_runs() {
        let _serial = SERIAL.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(parking_lot::Mutex::new(vec![]));
        let seen = Arc::clone(&calls);
        let function = JobFunction::new("model", move |ctx| {
            seen.lock().push(ctx.args().to_string());
            thread::sleep(Duration::from_millis(400));
            Ok(JobMeta::new())
        });
        // One worker, two admitted jobs: the second waits in the queue.
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let launcher =
            PooledLauncher::with_pool(function, Arc::clone(&pool)).with_timeout(Duration::from_millis(100));
        let mut jobs = function_jobs(&["--x=1", "--x=2"]);
        assert_eq!(run(&launcher, &mut jobs, dir.path()).await, BatchState::Complete);
        assert_eq!(jobs[0].status, JobStatus::Error);
        assert_eq!(jobs[1].status, JobStatus::Error);

        // Let the first call return and the worker drain its queue.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(*calls.lock(), vec!["--x=1".to_string()]);
        for n in 0..2 {
            let err = fs::read_to_string(dir.path().join(format!("model_{}.err", n))).unwrap();
            assert!(err.contains("timed out after 0.1 seconds"), "job {}: {:?}", n, err);
            assert!(sentinel::has_marker(&err));
        }
        assert!(!dir.path().join("model_1.out").exists());
    }

    #[tokio::test]
    async fn test_failed_recording_is_error() {
        let _serial = SERIAL.lock().await;
        let dir = tempfile::tempdir().unwrap();
        // Replaces its own stdout file with a directory, so the result
        // cannot be appended after the function returns.
        let function = JobFunction::new("model", |ctx| {
            let out = ctx.path("model_0.out");
            fs::remove_file(&out)?;
            fs::create_dir(&out)?;
            let mut meta = JobMeta::new();
            meta.insert("y".to_string(), Value::Float(1.0));
            Ok(meta)
        });
        let launcher = PooledLauncher::new(function, 1);
        let ledger = Arc::new(Ledger::new(2, vec![JobStatus::Pending]));
        launcher.begin().await.unwrap();
        assert!(ledger.try_admit(0, 2));
        let launch = Launch {
            job: 0,
            ordinal: 1,
            work: function_jobs(&["--x=1"]).remove(0).work,
            dir: dir.path().to_path_buf(),
            cpus: 2,
            stdout: dir.path().join("model_0.out"),
            stderr: dir.path().join("model_0.err"),
            header: vec![],
            dry_run: false,
        };
        launcher.launch(launch, Arc::clone(&ledger)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), ledger.wait(0))
            .await
            .unwrap();
        launcher.finish().await;

        assert_eq!(ledger.status(0), JobStatus::Error);
        assert_eq!(ledger.cpus_free(), 2);
        assert!(!ledger.finish(0, Outcome::Finished));
        assert_eq!(ledger.cpus_free(), 2);
        let err = fs::read_to_string(dir.path().join("model_0.err")).unwrap();
        assert!(err.contains("failed to record result"));
        assert!(sentinel::has_marker(&err));
    }

    #[tokio::test]
    async fn test_dry_run_skips_function() {
        let _serial = SERIAL.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let launcher = PooledLauncher::new(model(), 1);
        let mut jobs = function_jobs(&["--x=bad"]);
        let report = run_batch(
            &mut jobs,
            dir.path(),
            1,
            &launcher,
            &CancellationToken::new(),
            RunOptions {
                dry_run: true,
                verbosity: 0,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.state, BatchState::Complete);
        assert_eq!(jobs[0].status, JobStatus::Finished);
        let out = fs::read_to_string(dir.path().join("model_0.out")).unwrap();
        assert_eq!(
            sentinel::records(&out),
            vec![Record::new("DRY_RUN", 1i64, "--DRY RUN--")]
        );
    }

    #[test]
    fn test_check_rejects_other_work() {
        let launcher = PooledLauncher::new(model(), 1);
        let mut jobs = function_jobs(&["--x=1", "--x=2"]);
        jobs[1].work = Work::Function {
            function: "other".to_string(),
            args: String::new(),
        };
        assert_eq!(
            launcher.check(&jobs),
            Err(ConfigError::FunctionMismatch {
                job: 1,
                expected: "model".to_string(),
                found: "other".to_string()
            })
        );
        jobs[1].work = Work::Command("ls".to_string());
        assert_eq!(launcher.check(&jobs), Err(ConfigError::CommandOnPool(1)));
    }
}
