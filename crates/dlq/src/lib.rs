//! Dead-letter queue: inspection, retry and removal of jobs that exhausted
//! their retries, plus failure classification.

pub mod analysis;
pub mod error;
pub mod queue;

pub use analysis::{ErrorAnalysis, FailureCategory, analyze_error, failure_suggestions};
pub use error::{DlqError, DlqResult};
pub use queue::{DeadLetterQueue, DlqStatistics, FailureAnalysis, JobSummary};
