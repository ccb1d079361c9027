//! Pending grants
//!
//! While a permission request for a freshly added domain is in flight, the
//! domain is provisionally treated as granted for a short window. Entries
//! expire on their own and are swept the next time the ledger is read.

use std::collections::BTreeMap;

use siteguard_storage::{keys, Namespace, StateStore};

use crate::Result;

pub const PENDING_GRANT_TTL_MS: i64 = 15_000;

type GrantMap = BTreeMap<String, i64>;

pub struct PendingGrantLedger {
    store: StateStore,
    ttl_ms: i64,
}

impl PendingGrantLedger {
    pub fn new(store: StateStore) -> Self {
        Self::with_ttl(store, PENDING_GRANT_TTL_MS)
    }

    /// `ttl_ms` is clamped to `0..=PENDING_GRANT_TTL_MS`.
    pub fn with_ttl(store: StateStore, ttl_ms: i64) -> Self {
        let clamped = ttl_ms.clamp(0, PENDING_GRANT_TTL_MS);
        if clamped != ttl_ms {
            tracing::warn!(requested = ttl_ms, ttl_ms = clamped, "Pending grant TTL out of range");
        }
        Self {
            store,
            ttl_ms: clamped,
        }
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    /// Open (or extend) the window for `domain`. Returns its expiry.
    pub fn mark_pending(&self, domain: &str, now_ms: i64) -> Result<i64> {
        let expires_at = now_ms + self.ttl_ms;
        self.store
            .update(Namespace::Local, keys::PENDING_GRANTS, |current: Option<GrantMap>| {
                let mut grants: GrantMap = current
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|(_, expiry)| *expiry > now_ms)
                    .collect();
                grants.insert(domain.to_string(), expires_at);
                grants
            })?;

        tracing::debug!(domain, expires_at, "Marked grant pending");
        Ok(expires_at)
    }

    /// Close the window for `domain`. Returns whether one was open.
    pub fn clear(&self, domain: &str) -> Result<bool> {
        let mut removed = false;
        self.store
            .update(Namespace::Local, keys::PENDING_GRANTS, |current: Option<GrantMap>| {
                let mut grants = current.unwrap_or_default();
                removed = grants.remove(domain).is_some();
                grants
            })?;
        Ok(removed)
    }

    /// Unexpired entries. Expired ones found on the way are removed from
    /// storage; when there are none, nothing is written.
    pub fn live(&self, now_ms: i64) -> Result<GrantMap> {
        let grants: GrantMap = self
            .store
            .get_value(Namespace::Local, keys::PENDING_GRANTS)?
            .unwrap_or_default();

        if grants.values().all(|expiry| *expiry > now_ms) {
            return Ok(grants);
        }

        let live = self
            .store
            .update(Namespace::Local, keys::PENDING_GRANTS, |current: Option<GrantMap>| {
                current
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|(_, expiry)| *expiry > now_ms)
                    .collect::<GrantMap>()
            })?;

        tracing::debug!(remaining = live.len(), "Swept expired pending grants");
        Ok(live)
    }

    pub fn is_pending(&self, domain: &str, now_ms: i64) -> Result<bool> {
        Ok(self.live(now_ms)?.contains_key(domain))
    }
}
