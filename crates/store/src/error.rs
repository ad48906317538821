//! Store error type.

use std::path::PathBuf;
use std::time::Duration;

use jobq_core::JobError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Job store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not acquire lock for {} after {waited:?}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode table: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("store mutex poisoned")]
    Poisoned,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
