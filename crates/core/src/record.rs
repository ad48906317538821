//! On-disk job record codec.
//!
//! Records are stored as JSON objects keyed by job id. The codec is the only
//! place that maps between [`Job`] and that representation: state tags are
//! parsed strictly and records written by a newer schema are refused rather
//! than guessed at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JobError, JobResult};
use crate::id::JobId;
use crate::job::{DEFAULT_MAX_RETRIES, Job, JobState};

/// Schema version written with every record.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    #[serde(default = "legacy_schema")]
    schema_version: u32,
    id: String,
    command: String,
    state: String,
    #[serde(default)]
    attempts: u32,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    priority: i64,
}

fn legacy_schema() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Encode a job as a stored record.
pub fn encode_job(job: &Job) -> JobResult<Value> {
    let record = JobRecord {
        schema_version: RECORD_SCHEMA_VERSION,
        id: job.id.to_string(),
        command: job.command.clone(),
        state: job.state.as_str().to_string(),
        attempts: job.attempts,
        max_retries: job.max_retries,
        created_at: job.created_at,
        updated_at: job.updated_at,
        output: job.output.clone(),
        error: job.error.clone(),
        timeout: job.timeout,
        priority: job.priority,
    };
    serde_json::to_value(record).map_err(|e| JobError::Encode(e.to_string()))
}

/// Decode a stored record, rejecting unknown state tags and newer schemas.
pub fn decode_job(value: &Value) -> JobResult<Job> {
    let record = JobRecord::deserialize(value)
        .map_err(|e| JobError::validation(format!("malformed job record: {e}")))?;

    if record.schema_version > RECORD_SCHEMA_VERSION {
        return Err(JobError::validation(format!(
            "job record schema {} is newer than supported {}",
            record.schema_version, RECORD_SCHEMA_VERSION
        )));
    }

    let state: JobState = record.state.parse()?;
    let id = JobId::parse(record.id)?;

    Ok(Job {
        id,
        command: record.command,
        state,
        attempts: record.attempts,
        max_retries: record.max_retries,
        created_at: record.created_at,
        updated_at: record.updated_at,
        output: record.output,
        error: record.error,
        timeout: record.timeout,
        priority: record.priority,
    })
}
