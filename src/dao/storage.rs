use std::error::Error;
use thiserror::Error;

use crate::dao::models::Table;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by session stores regardless of the underlying backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A row with the same primary key already exists.
    #[error("row `{id}` already exists in `{table}`")]
    Conflict { table: Table, id: String },
    /// A stored row could not be decoded into its typed record.
    #[error("malformed row in `{table}`")]
    Malformed {
        table: Table,
        #[source]
        source: serde_json::Error,
    },
    /// A write that targets existing rows matched none.
    #[error("no row of `{table}` matches {target}")]
    Missing { table: Table, target: String },
    /// The store refused the request itself (missing primary key, non-object patch...).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Whether the error signals a primary key collision.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }
}
