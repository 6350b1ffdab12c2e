//! Store error types.

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema initialization failed: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate key: a record with id {0} already exists")]
    DuplicateKey(uuid::Uuid),
}
