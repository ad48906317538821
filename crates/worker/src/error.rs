use std::path::PathBuf;

use jobq_core::WorkerId;
use jobq_store::StoreError;

/// Why a command produced no exit status.
///
/// The display text is what ends up in the job's `error` field.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Execution error: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Job timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
    #[error("Execution error: {0}")]
    Wait(#[source] std::io::Error),
}

/// Worker pool error.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to start worker {worker}: {source}")]
    Spawn {
        worker: WorkerId,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to install signal handlers: {0}")]
    Signal(#[from] ctrlc::Error),
}

impl PoolError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
