use thiserror::Error;
use uuid::Uuid;

use super::persister::PersistError;
use crate::jobs::JobStoreError;
use crate::notify::NotifyError;
use crate::queue::QueueError;
use crate::retry::default_is_transient;
use crate::storage::StorageError;

/// Why a caller's retry request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RetryRejection {
    #[error("Only failed jobs can be retried")]
    NotFailed,
    #[error("Maximum retries reached")]
    MaxRetriesReached,
    #[error("source file no longer available")]
    SourceMissing,
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// Bad caller input. Never retried.
    #[error("{0}")]
    Validation(String),

    #[error("batch job {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    RetryRejected(RetryRejection),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("product insert failed: {0}")]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

impl IngestError {
    /// True for infrastructure failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Validation(_)
            | IngestError::NotFound(_)
            | IngestError::RetryRejected(_) => false,
            IngestError::Persist(err) => err.is_retryable() || default_is_transient(err),
            IngestError::Jobs(JobStoreError::Pool(_)) | IngestError::Queue(QueueError::Pool(_)) => {
                true
            }
            other => default_is_transient(other),
        }
    }
}
