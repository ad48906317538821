use jobq_core::JobId;
use jobq_store::StoreError;

pub type DlqResult<T> = Result<T, DlqError>;

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("job {0} not found in dead-letter queue")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
}
