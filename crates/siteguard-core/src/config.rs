//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use siteguard_policy::{RetryPolicy, ALL_URLS, PENDING_GRANT_TTL_MS};

use crate::error::CoreError;
use crate::Result;

/// Database path that selects an in-memory store
pub const IN_MEMORY: &str = ":memory:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the database file
    pub database_path: PathBuf,
    /// Local page blocked navigations are redirected to
    pub blocked_page: String,
    /// How long a pending grant counts as granted
    pub pending_grant_ttl_ms: i64,
    /// Quiet period before storage edits trigger a sync
    pub debounce_ms: u64,
    /// Re-query policy for failing grant checks
    pub oracle_retry: RetryPolicy,
    /// Origin patterns the daemon's grant table starts with
    pub granted_origins: Vec<String>,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("siteguard.db"),
            blocked_page: "ext://siteguard/blocked.html".to_string(),
            pending_grant_ttl_ms: PENDING_GRANT_TTL_MS,
            debounce_ms: 100,
            oracle_retry: RetryPolicy::default(),
            granted_origins: vec![ALL_URLS.to_string()],
        }
    }

    /// Defaults backed by an in-memory database
    pub fn in_memory() -> Self {
        Self {
            database_path: PathBuf::from(IN_MEMORY),
            ..Self::default()
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw).map_err(|e| {
            CoreError::Config(format!("{}: {}", path.as_ref().display(), e))
        })
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("SiteGuard"))
            .unwrap_or_else(|| PathBuf::from(".siteguard"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"debounce_ms": 250, "oracle_retry": {"max_retries": 3}}"#)
                .unwrap();

        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.oracle_retry.max_retries, 3);
        assert_eq!(config.oracle_retry.backoff_ms, RetryPolicy::default().backoff_ms);
        assert_eq!(config.pending_grant_ttl_ms, PENDING_GRANT_TTL_MS);
        assert_eq!(config.granted_origins, vec![ALL_URLS.to_string()]);
    }

    #[test]
    fn test_in_memory() {
        assert!(Config::in_memory().is_in_memory());
        assert!(!Config::new(PathBuf::from("/tmp")).is_in_memory());
    }
}
