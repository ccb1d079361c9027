//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] siteguard_storage::StorageError),

    #[error("Policy error: {0}")]
    Policy(#[from] siteguard_policy::PolicyError),

    #[error("Enforcement error: {0}")]
    Enforcement(#[from] siteguard_policy::EnforcementError),

    #[error("Alarm error: {0}")]
    Alarm(#[from] crate::alarms::AlarmError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),

    #[error("Sync failed: {0}")]
    Sync(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_not_config_errors() {
        let err: CoreError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into();
        assert!(matches!(err, CoreError::Io(_)));
        assert_eq!(err.to_string(), "IO error: read-only");
    }
}
