//! `jobq-core`: job model building blocks.
//!
//! This crate contains the **pure** job model (no storage or process concerns):
//! identifiers, the job state machine, intake validation and the on-disk
//! record codec.

pub mod error;
pub mod id;
pub mod job;
pub mod record;
pub mod validation;

pub use error::{JobError, JobResult};
pub use id::{JobId, WorkerId};
pub use job::{DEFAULT_MAX_RETRIES, Job, JobState, NewJob};
pub use record::{RECORD_SCHEMA_VERSION, decode_job, encode_job};
