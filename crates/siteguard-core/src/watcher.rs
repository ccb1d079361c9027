//! Storage change watcher
//!
//! Edits to the blocklist or the pause windows can come from any frontend.
//! A burst of them is collapsed into one sync request once storage has been
//! quiet for the debounce period.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use siteguard_storage::{keys, Namespace, StateStore, StorageChange};

use crate::coordinator::SyncCoordinator;

fn is_relevant(change: &StorageChange) -> bool {
    change.touches(Namespace::Synced, keys::BLOCKED_DOMAINS)
        || change.touches(Namespace::Local, keys::PAUSED_UNTIL_TS)
        || change.touches(Namespace::Local, keys::PAUSED_DOMAINS)
}

/// Spawn the watcher. It runs until the store is dropped.
pub fn spawn_change_watcher(
    store: &StateStore,
    coordinator: Arc<SyncCoordinator>,
    debounce: Duration,
) -> JoinHandle<()> {
    let mut changes = store.subscribe();

    tokio::spawn(async move {
        let mut deadline: Option<Instant> = None;

        loop {
            let received = match deadline {
                Some(at) => match timeout_at(at, changes.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        deadline = None;
                        tracing::debug!("Storage settled, requesting sync");
                        coordinator.request();
                        continue;
                    }
                },
                None => changes.recv().await,
            };

            match received {
                Ok(change) if is_relevant(&change) => {
                    deadline = Some(Instant::now() + debounce);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    // Missed changes may have been relevant
                    tracing::debug!(missed, "Change watcher lagged");
                    deadline = Some(Instant::now() + debounce);
                }
                Err(RecvError::Closed) => break,
            }
        }

        tracing::debug!("Change watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use siteguard_policy::{
        GrantTable, InMemoryEnforcer, PendingGrantLedger, PermissionOracle,
        PermissionReconciler, RuleCompiler, ALL_URLS,
    };
    use siteguard_storage::Database;

    fn setup() -> (StateStore, Arc<SyncCoordinator>, Arc<InMemoryEnforcer>) {
        let store = StateStore::new(Database::open_in_memory().unwrap());
        let enforcer = Arc::new(InMemoryEnforcer::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            PermissionReconciler::new(
                store.clone(),
                PermissionOracle::new(Arc::new(GrantTable::with_grants([ALL_URLS]))),
                PendingGrantLedger::new(store.clone()),
            ),
            RuleCompiler::new("ext://siteguard/blocked.html").unwrap(),
            enforcer.clone(),
            Arc::new(ManualClock::new(0)),
        ));
        (store, coordinator, enforcer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_edits_triggers_one_pass() {
        let (store, coordinator, enforcer) = setup();
        let watcher = spawn_change_watcher(&store, coordinator.clone(), Duration::from_millis(100));

        for domain in ["a.com", "b.com", "c.com"] {
            store
                .update(Namespace::Synced, keys::BLOCKED_DOMAINS, |current: Option<Vec<String>>| {
                    let mut list = current.unwrap_or_default();
                    list.push(domain.to_string());
                    list
                })
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(coordinator.passes(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(coordinator.passes(), 1);
        assert_eq!(enforcer.rule_count(), 3);

        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_keys_are_ignored() {
        let (store, coordinator, _) = setup();
        let watcher = spawn_change_watcher(&store, coordinator.clone(), Duration::from_millis(100));

        store
            .set_value(Namespace::Local, keys::PENDING_GRANTS, &serde_json::json!({"a.com": 1}))
            .unwrap();
        store
            .set_value(Namespace::Synced, keys::PAUSED_UNTIL_TS, &5)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(coordinator.passes(), 0);

        watcher.abort();
    }
}
