//! Host permission checks
//!
//! The process may only enforce rules for hosts it holds a grant for. Grants
//! live in an external capability system; `PermissionOracle` asks it about a
//! domain by probing origin patterns from broadest to narrowest.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{is_valid_domain, MAX_DOMAIN_LEN};

/// Unrestricted host access
pub const ALL_URLS: &str = "<all_urls>";

#[derive(Error, Debug, Clone)]
pub enum CapabilityError {
    #[error("Capability query failed: {0}")]
    Unavailable(String),
}

/// External capability system holding origin-pattern grants.
#[async_trait]
pub trait CapabilitySystem: Send + Sync {
    async fn contains(&self, origin_pattern: &str) -> Result<bool, CapabilityError>;
}

/// Origin patterns that would grant access to `domain`, broadest first.
pub fn origin_patterns(domain: &str) -> Vec<String> {
    vec![
        ALL_URLS.to_string(),
        "*://*/*".to_string(),
        format!("*://*.{domain}/*"),
        format!("*://{domain}/*"),
        format!("https://*.{domain}/*"),
        format!("https://{domain}/*"),
        format!("http://*.{domain}/*"),
        format!("http://{domain}/*"),
    ]
}

/// How often to re-ask the capability system about one pattern before
/// counting it as a non-match. The default never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 250,
        }
    }
}

pub struct PermissionOracle {
    capabilities: Arc<dyn CapabilitySystem>,
    retry: RetryPolicy,
}

impl PermissionOracle {
    pub fn new(capabilities: Arc<dyn CapabilitySystem>) -> Self {
        Self::with_retry(capabilities, RetryPolicy::default())
    }

    pub fn with_retry(capabilities: Arc<dyn CapabilitySystem>, retry: RetryPolicy) -> Self {
        Self {
            capabilities,
            retry,
        }
    }

    /// Whether the process currently holds access to `domain`.
    ///
    /// Malformed domains are denied without asking. A pattern whose query
    /// keeps failing counts as a non-match; running out of patterns denies.
    pub async fn has_access(&self, domain: &str) -> bool {
        if domain.len() > MAX_DOMAIN_LEN || !is_valid_domain(domain) {
            tracing::debug!(domain, "Denying malformed domain");
            return false;
        }

        for pattern in origin_patterns(domain) {
            if self.query(&pattern).await {
                return true;
            }
        }

        false
    }

    async fn query(&self, pattern: &str) -> bool {
        let mut attempt = 0;
        loop {
            match self.capabilities.contains(pattern).await {
                Ok(granted) => return granted,
                Err(e) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::debug!(pattern, attempt, error = %e, "Retrying grant query");
                    if self.retry.backoff_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(self.retry.backoff_ms)).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "Grant query failed, treating as no match");
                    return false;
                }
            }
        }
    }
}

/// In-process capability system: a set of granted origin patterns.
pub struct GrantTable {
    granted: RwLock<HashSet<String>>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self {
            granted: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_grants<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: RwLock::new(patterns.into_iter().map(Into::into).collect()),
        }
    }

    pub fn grant(&self, pattern: &str) {
        self.granted.write().insert(pattern.to_string());
    }

    pub fn revoke(&self, pattern: &str) {
        self.granted.write().remove(pattern);
    }

    /// Grant access to `domain` and all of its subdomains.
    pub fn grant_domain(&self, domain: &str) {
        self.grant(&format!("*://*.{domain}/*"));
    }

    /// Drop every pattern that names `domain` specifically.
    pub fn revoke_domain(&self, domain: &str) {
        let specific: HashSet<String> = origin_patterns(domain).into_iter().skip(2).collect();
        self.granted.write().retain(|p| !specific.contains(p));
    }

    pub fn is_granted(&self, pattern: &str) -> bool {
        self.granted.read().contains(pattern)
    }

    pub fn granted_patterns(&self) -> Vec<String> {
        let mut out: Vec<String> = self.granted.read().iter().cloned().collect();
        out.sort();
        out
    }
}

impl Default for GrantTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilitySystem for GrantTable {
    async fn contains(&self, origin_pattern: &str) -> Result<bool, CapabilityError> {
        Ok(self.is_granted(origin_pattern))
    }
}
