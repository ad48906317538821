//! Job execution: the per-process worker loop and the pool that supervises
//! worker processes.
//!
//! ## Design
//!
//! - One `Worker` drives one job at a time through its own store handle
//! - Commands run through a `CommandExecutor`; `ShellExecutor` uses `sh -c`
//!   in a fresh process group with a hard timeout
//! - Failures are recorded on the job, never raised out of the loop
//! - `WorkerPool` starts each worker as a separate OS process and finds them
//!   again through a pid discovery file
//!
//! Unix only: process groups and signals come from `libc`.

pub mod error;
pub mod executor;
pub mod pool;
pub mod signals;
pub mod worker;

pub use error::{ExecutionError, PoolError};
pub use executor::{CommandExecutor, CommandOutput, ShellExecutor};
pub use pool::{StopReport, WorkerPool, WorkerStatus, run_worker_process};
pub use signals::{ShutdownSignal, install_process_handlers};
pub use worker::{Outcome, Worker, WorkerHandle, WorkerSettings, WorkerStats};
