//! Permission reconciliation
//!
//! Filters the declared blocklist down to domains the process may enforce.
//! A domain that is neither pending nor granted is demoted: it is removed
//! from the persisted blocklist, not merely skipped for this pass.

use std::collections::BTreeSet;

use siteguard_storage::{keys, Namespace, StateStore};

use crate::domain::normalize_list;
use crate::pending::PendingGrantLedger;
use crate::permissions::PermissionOracle;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Sorted, deduplicated domains that may be enforced
    pub authorized: Vec<String>,
    /// Domains removed from the blocklist by this call
    pub demoted: Vec<String>,
}

pub struct PermissionReconciler {
    store: StateStore,
    oracle: PermissionOracle,
    ledger: PendingGrantLedger,
}

impl PermissionReconciler {
    pub fn new(store: StateStore, oracle: PermissionOracle, ledger: PendingGrantLedger) -> Self {
        Self {
            store,
            oracle,
            ledger,
        }
    }

    pub fn ledger(&self) -> &PendingGrantLedger {
        &self.ledger
    }

    pub async fn reconcile(&self, declared: &[String], now_ms: i64) -> Result<Reconciliation> {
        let normalized = normalize_list(declared);
        let pending = self.ledger.live(now_ms)?;

        let mut authorized = Vec::with_capacity(normalized.len());
        let mut denied = Vec::new();
        for domain in normalized {
            if pending.contains_key(&domain) || self.oracle.has_access(&domain).await {
                authorized.push(domain);
            } else {
                denied.push(domain);
            }
        }

        if !denied.is_empty() || authorized.as_slice() != declared {
            self.rewrite_blocklist(&denied)?;
        }

        for domain in &denied {
            tracing::info!(domain = %domain, "Demoted domain without host permission");
        }

        Ok(Reconciliation {
            authorized,
            demoted: denied,
        })
    }

    /// Remove `denied` from whatever is persisted now and store the canonical
    /// form. Domains added since the pass read the list are kept.
    fn rewrite_blocklist(&self, denied: &[String]) -> Result<()> {
        let denied: BTreeSet<&str> = denied.iter().map(String::as_str).collect();

        self.store.update(
            Namespace::Synced,
            keys::BLOCKED_DOMAINS,
            |current: Option<Vec<String>>| {
                normalize_list(current.unwrap_or_default())
                    .into_iter()
                    .filter(|d| !denied.contains(d.as_str()))
                    .collect::<Vec<String>>()
            },
        )?;
        Ok(())
    }
}
