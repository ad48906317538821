//! Job entity and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};
use crate::id::JobId;
use crate::validation::validate_command;

/// Retry budget used when the producer does not name one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Job lifecycle state.
///
/// ```text
/// Pending -> Processing -> Completed
///                       -> Failed -> Pending (retry)
///                                 -> Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Queued, waiting to be picked up
    Pending,
    /// Owned by a worker and executing
    Processing,
    /// Finished with exit code 0
    Completed,
    /// Last execution failed; about to be retried or buried
    Failed,
    /// Retries exhausted, lives in the dead-letter queue
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    /// Lowercase tag used on disk and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// Edges of the automatic state machine.
    pub fn can_transition_to(self, to: JobState) -> bool {
        matches!(
            (self, to),
            (JobState::Pending, JobState::Processing)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
                | (JobState::Failed, JobState::Pending)
                | (JobState::Failed, JobState::Dead)
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| JobError::validation(format!("unknown job state tag: {s:?}")))
    }
}

/// A queued shell command with its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    /// Executions started so far
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Captured stdout of the successful run
    pub output: Option<String>,
    /// Failure description of the last failed run
    pub error: Option<String>,
    /// Execution bound in seconds; the worker default applies when absent
    pub timeout: Option<u64>,
    /// Higher is dispatched first
    pub priority: i64,
}

impl Job {
    /// Create a pending job with a generated id.
    pub fn new(command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now,
            updated_at: now,
            output: None,
            error: None,
            timeout: None,
            priority: 0,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// `attempts < max_retries` while the job sits in `Failed`.
    pub fn should_retry(&self) -> bool {
        self.state == JobState::Failed && self.attempts < self.max_retries
    }

    /// Exponential backoff in seconds: `base ^ attempts`.
    pub fn retry_delay(&self, base: f64) -> f64 {
        base.powi(self.attempts.min(i32::MAX as u32) as i32)
    }

    /// Move along an edge of the automatic state machine.
    pub fn transition(&mut self, to: JobState) -> JobResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.touch();
        Ok(())
    }

    /// Pending -> Processing, on acquisition.
    pub fn claim(&mut self) -> JobResult<()> {
        self.transition(JobState::Processing)
    }

    /// Count one more execution attempt.
    pub fn begin_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.touch();
    }

    /// Processing -> Completed, recording stdout.
    pub fn complete(&mut self, output: impl Into<String>) -> JobResult<()> {
        self.transition(JobState::Completed)?;
        self.output = Some(output.into());
        Ok(())
    }

    /// Processing -> Failed, recording the failure text.
    pub fn fail(&mut self, error: impl Into<String>) -> JobResult<()> {
        self.transition(JobState::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Failed -> Pending for another attempt. Clears `error`.
    pub fn requeue(&mut self) -> JobResult<()> {
        self.transition(JobState::Pending)?;
        self.error = None;
        Ok(())
    }

    /// Failed -> Dead, retries exhausted.
    pub fn bury(&mut self) -> JobResult<()> {
        self.transition(JobState::Dead)
    }

    /// Dead -> Pending on operator request from the dead-letter queue.
    ///
    /// Not an edge of the automatic state machine.
    pub fn revive(&mut self, reset_attempts: bool) -> JobResult<()> {
        if self.state != JobState::Dead {
            return Err(JobError::InvalidTransition {
                from: self.state,
                to: JobState::Pending,
            });
        }
        if reset_attempts {
            self.attempts = 0;
        }
        self.state = JobState::Pending;
        self.error = None;
        self.touch();
        Ok(())
    }

    /// Processing -> Pending for a job abandoned by a crashed worker.
    ///
    /// Not an edge of the automatic state machine.
    pub fn release_orphan(&mut self) -> JobResult<()> {
        if self.state != JobState::Processing {
            return Err(JobError::InvalidTransition {
                from: self.state,
                to: JobState::Pending,
            });
        }
        self.state = JobState::Pending;
        self.touch();
        Ok(())
    }

    // `updated_at` never moves backwards, even across clock adjustments.
    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

impl core::fmt::Display for Job {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Job(id={}, command={:?}, state={}, attempts={})",
            self.id, self.command, self.state, self.attempts
        )
    }
}

/// Producer-side job description, as accepted by `enqueue`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(default)]
    pub id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub priority: Option<i64>,
}

impl NewJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Validate and build a pending job.
    ///
    /// `default_max_retries` applies when the producer left `max_retries` unset.
    pub fn into_job(self, default_max_retries: u32) -> JobResult<Job> {
        validate_command(&self.command)?;

        let id = match self.id {
            Some(raw) => JobId::parse(raw)?,
            None => JobId::generate(),
        };

        if self.timeout == Some(0) {
            return Err(JobError::validation("timeout must be at least 1 second"));
        }

        let mut job = Job::new(self.command)
            .with_id(id)
            .with_max_retries(self.max_retries.unwrap_or(default_max_retries))
            .with_priority(self.priority.unwrap_or(0));
        job.timeout = self.timeout;
        Ok(job)
    }
}
