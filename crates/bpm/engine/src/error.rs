//! Error types for the engine's external collaborators

use bpm_types::FlowError;
use thiserror::Error;

/// Durable-store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent writer won (serialization failure, unique violation)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Stored row could not be decoded
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query error
    #[error("Query error: {0}")]
    Query(String),
}

/// Identity-directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Directory lookup failed: {0}")]
    Lookup(String),
}

/// Delayed-job queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid payload for job {job}: {reason}")]
    InvalidPayload { job: String, reason: String },

    #[error("Queue backend error: {0}")]
    Backend(String),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for directory lookups
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

impl From<StoreError> for FlowError {
    fn from(err: StoreError) -> Self {
        match err {
            // A lost optimistic race reads the same as a stale pre-state.
            StoreError::Conflict(msg) => FlowError::Precondition(msg),
            other => FlowError::Storage(other.to_string()),
        }
    }
}

impl From<DirectoryError> for FlowError {
    fn from(err: DirectoryError) -> Self {
        FlowError::Directory(err.to_string())
    }
}

impl From<QueueError> for FlowError {
    fn from(err: QueueError) -> Self {
        FlowError::Queue(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpm_types::ErrorKind;

    #[test]
    fn test_conflict_maps_to_precondition() {
        let err: FlowError = StoreError::Conflict("could not serialize access".into()).into();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_other_store_errors_are_internal() {
        let err: FlowError = StoreError::Connection("refused".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_directory_and_queue_errors_are_internal() {
        let dir: FlowError = DirectoryError::Unavailable("ldap down".into()).into();
        let queue: FlowError = QueueError::Backend("redis".into()).into();
        assert_eq!(dir.kind(), ErrorKind::Internal);
        assert_eq!(queue.kind(), ErrorKind::Internal);
    }
}
