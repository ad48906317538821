//! Persistent job store.
//!
//! ## Design
//!
//! - Three independent JSON tables in one directory: `jobs.json`, `locks.json`
//!   and `config.json`
//! - Every write serializes the whole table to a temp file in the same
//!   directory and renames it over the old one
//! - Writers exclude each other across processes with a `<table>.lock` file
//!   created exclusively (bounded spin-wait), and within a process with a mutex
//! - Leases bind a Processing job to one worker and expire after a TTL
//!
//! ## Components
//!
//! - `JobStore`: the store contract
//! - `FileJobStore`: crash-safe, multi-process implementation
//! - `InMemoryJobStore`: same semantics without the filesystem, for tests/dev
//! - `ConfigStore` / `QueueConfig`: the flat configuration table

pub mod config;
pub mod error;
pub mod file_lock;
pub mod file_store;
pub mod memory;
pub mod process;
pub mod store;

mod atomic;
mod tables;

pub use config::{ConfigStore, QueueConfig};
pub use error::{StoreError, StoreResult};
pub use file_lock::{FileLock, LockOptions};
pub use file_store::{FileJobStore, StoreOptions};
pub use memory::InMemoryJobStore;
pub use process::pid_alive;
pub use store::{JobCounts, JobStore};
pub use tables::Lease;
