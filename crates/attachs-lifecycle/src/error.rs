//! Lifecycle errors
//!
//! Every failure surfaced by the engine maps onto an [`ErrorKind`] so callers
//! can tell retryable failures from caller mistakes.

use attachs_core::{ErrorKind, Id, ValidationErrors};
use thiserror::Error;

use crate::model::AttachmentState;
use crate::storage::StorageError;
use crate::transform::TransformError;

/// Service errors
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Attachment not found: {0}")]
    NotFound(Id),
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),
    #[error("Invalid state transition for attachment {id:?}: {from} -> {to}")]
    InvalidState {
        id: Option<Id>,
        from: AttachmentState,
        to: AttachmentState,
    },
    #[error("Attachment {id} was modified concurrently (lock version {lock_version})")]
    Conflict { id: Id, lock_version: i32 },
    #[error("File too large: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },
    #[error("Database error: {0}")]
    Database(String),
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;

impl AttachmentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) | Self::InvalidState { .. } | Self::FileTooLarge { .. } => {
                ErrorKind::Validation
            }
            Self::Storage(e) => e.kind(),
            Self::Transform(_) => ErrorKind::Transform,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Database(_) => ErrorKind::Io,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Validation errors carried by this error, if any
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            Self::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attachs_core::UNPROCESSED;

    #[test]
    fn test_kinds() {
        let err = AttachmentError::from(ValidationErrors::base(UNPROCESSED));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
        assert!(err.validation_errors().unwrap().has_base(UNPROCESSED));

        let err = AttachmentError::from(TransformError::Failed("boom".into()));
        assert!(err.is_retryable());

        let err = AttachmentError::from(StorageError::Backend("down".into()));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.is_retryable());

        let err = AttachmentError::from(StorageError::NotFound("a/b".into()));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = AttachmentError::Conflict { id: 1, lock_version: 2 };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_retryable());
    }
}
