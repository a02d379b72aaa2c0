//! uqsweep: A CPU-Budgeted Parameter Sweep Runner.

// Serde helper module.
mod serde;
// Command line arguments and the sweep file.
pub mod config;
// Realizations of the input parameters.
pub mod design;
// Error handling.
pub mod error;
// Work items and saved job records.
pub mod job;
// CPU budget and running-set bookkeeping.
pub mod capacity;
// CPU-budgeted batch scheduling.
pub mod scheduler;
// Subprocess substrate.
pub mod process;
// Worker pool and pooled substrate.
pub mod pool;
// The sweep host.
pub mod host;
// Completion scan over job stderr files.
pub mod status;
// Result collection into the store.
pub mod collect;
// Sentinel records in job output.
pub mod sentinel;
// Result store.
pub mod store;
// Test program that turns realizations into jobs.
pub mod program;
// Console output.
pub mod monitor;
// Synchronization primitives.
pub mod sync;

pub use capacity::{Ledger, Outcome, POLL_INTERVAL};
pub use collect::{collect, harvest, CollectOptions};
pub use config::{Config, Mode, SweepFile};
pub use design::{Assignment, ListDesign, ParamInfo, Realization};
pub use error::{ConfigError, SweepError};
pub use host::{secs_to_walltime, walltime_to_secs, Host};
pub use job::{FailedJob, Job, JobRecord, JobStatus, Work};
pub use pool::{
    AsyncResult, JobContext, JobFunction, JobFnResult, JobMeta, PoolLease, PooledLauncher,
    Resolution, TaskFailure, WorkerPool, DEFAULT_TIMEOUT,
};
pub use process::ProcessLauncher;
pub use program::{ProgramSpec, TestProgram};
pub use scheduler::{run_batch, BatchReport, BatchState, Launch, RunOptions, Substrate};
pub use sentinel::{Record, SentinelError, Value};
pub use status::StatusReport;
pub use store::{DirStore, MemoryStore, ResultStore, StoreOptions};
pub use sync::LockedFile;
