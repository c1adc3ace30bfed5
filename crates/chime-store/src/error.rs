//! Error types for the SQLite stores.

use chime_scheduler::RepositoryError;
use thiserror::Error;

/// Errors from the SQLite-backed stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored document could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// The blocking task running the query failed.
    #[error("background task failed: {0}")]
    Join(String),
}

impl From<StoreError> for RepositoryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Serialization(inner) => RepositoryError::Serialization(inner),
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(failure, message))
                if matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                RepositoryError::ConcurrentModification(
                    message.unwrap_or_else(|| "database busy".to_string()),
                )
            }
            other => RepositoryError::Storage(other.to_string()),
        }
    }
}
