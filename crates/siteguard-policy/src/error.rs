//! Policy error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Storage error: {0}")]
    Storage(#[from] siteguard_storage::StorageError),

    #[error("Enforcement error: {0}")]
    Enforcement(#[from] crate::enforcement::EnforcementError),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid blocked page URL: {0}")]
    InvalidBlockedPage(#[from] url::ParseError),
}
