//! Error types for the approval-flow layer

use crate::{FlowDefinitionId, FlowInstanceId, NodeId, TaskId};

/// Errors that can occur in flow operations
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Flow definition not found: {0}")]
    DefinitionNotFound(FlowDefinitionId),

    #[error("No published main definition for code: {0}")]
    NoMainDefinition(String),

    #[error("Flow instance not found: {0}")]
    InstanceNotFound(FlowInstanceId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Job queue error: {0}")]
    Queue(String),
}

/// Coarse classification of a [`FlowError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    /// Benign race: the target was already resolved or terminated
    Precondition,
    NotFound,
    /// Infrastructure fault; the caller may retry the operation
    Internal,
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unauthorized(_) => ErrorKind::Authorization,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::DefinitionNotFound(_)
            | Self::NoMainDefinition(_)
            | Self::InstanceNotFound(_)
            | Self::TaskNotFound(_)
            | Self::NodeNotFound(_)
            | Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(_) | Self::Directory(_) | Self::Queue(_) => ErrorKind::Internal,
        }
    }

    pub fn is_precondition(&self) -> bool {
        self.kind() == ErrorKind::Precondition
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}

/// Result type alias for flow operations
pub type FlowResult<T> = Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(FlowError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(FlowError::unauthorized("x").kind(), ErrorKind::Authorization);
        assert!(FlowError::precondition("already resolved").is_precondition());
        assert_eq!(
            FlowError::TaskNotFound(TaskId::new("t")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(FlowError::Storage("io".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_display() {
        let err = FlowError::InstanceNotFound(FlowInstanceId::new("abc"));
        assert_eq!(err.to_string(), "Flow instance not found: abc");
    }
}
