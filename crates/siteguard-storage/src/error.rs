//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("Malformed value for {namespace}.{key}: {reason}")]
    MalformedValue {
        namespace: String,
        key: String,
        reason: String,
    },
}
