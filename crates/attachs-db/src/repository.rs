//! Repository errors
//!
//! Database failures surface to the engine as `AttachmentError::Database`,
//! except lost compare-and-swap races, which keep their conflict meaning.

use attachs_core::Id;
use attachs_lifecycle::AttachmentError;

/// Error type for repository operations
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(Id),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid row data: {0}")]
    InvalidData(String),

    #[error("Stale lock version {lock_version} for {id}")]
    Conflict { id: Id, lock_version: i32 },
}

/// Result type for repository operations
pub type RepositoryResult<T> = Result<T, RepositoryError>;

impl From<RepositoryError> for AttachmentError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => AttachmentError::NotFound(id),
            RepositoryError::Conflict { id, lock_version } => {
                AttachmentError::Conflict { id, lock_version }
            }
            other => AttachmentError::Database(other.to_string()),
        }
    }
}
