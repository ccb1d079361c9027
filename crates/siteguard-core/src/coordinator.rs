//! Sync coordinator
//!
//! ```text
//! Idle --request--> Syncing --request--> Syncing+ResyncPending
//!   ^                  |                        |
//!   +----pass done-----+      pass done: run one more pass, back to Syncing
//! ```
//!
//! At most one pass is in flight. Any number of requests made during a pass
//! collapse into a single trailing pass, so the latest request is always
//! followed by a complete pass.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use siteguard_policy::{
    is_reserved_rule_id, EnforcementLayer, PendingGrantLedger, PermissionReconciler, RuleCompiler,
};
use siteguard_storage::{keys, Namespace, StateStore};

use crate::clock::Clock;
use crate::error::CoreError;
use crate::snooze::PauseState;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    Idle,
    Syncing,
    SyncingResyncPending,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::SyncingResyncPending => "syncing+resync",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pass: u64,
    pub declared: usize,
    pub authorized: Vec<String>,
    pub active: Vec<String>,
    pub demoted: Vec<String>,
    pub globally_paused: bool,
    pub rules_installed: usize,
}

/// Handed out per request; resolves once a pass that started after the
/// request has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncTicket(u64);

#[derive(Debug, Clone)]
struct PassOutcome {
    /// Highest ticket this pass satisfies
    covers: u64,
    result: std::result::Result<SyncReport, String>,
}

struct Machine {
    state: SyncState,
    requested: u64,
    covering: u64,
}

pub struct SyncCoordinator {
    store: StateStore,
    reconciler: PermissionReconciler,
    compiler: RuleCompiler,
    enforcer: Arc<dyn EnforcementLayer>,
    clock: Arc<dyn Clock>,
    machine: Mutex<Machine>,
    outcomes: watch::Sender<Option<PassOutcome>>,
    passes: AtomicU64,
}

impl SyncCoordinator {
    pub fn new(
        store: StateStore,
        reconciler: PermissionReconciler,
        compiler: RuleCompiler,
        enforcer: Arc<dyn EnforcementLayer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (outcomes, _) = watch::channel(None);
        Self {
            store,
            reconciler,
            compiler,
            enforcer,
            clock,
            machine: Mutex::new(Machine {
                state: SyncState::Idle,
                requested: 0,
                covering: 0,
            }),
            outcomes,
            passes: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SyncState {
        self.machine.lock().state
    }

    /// Passes started so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn ledger(&self) -> &PendingGrantLedger {
        self.reconciler.ledger()
    }

    pub fn enforcer(&self) -> &Arc<dyn EnforcementLayer> {
        &self.enforcer
    }

    /// Ask for a pass without waiting for it. Must be called within a tokio
    /// runtime.
    pub fn request(self: &Arc<Self>) -> SyncTicket {
        let mut machine = self.machine.lock();
        machine.requested += 1;
        let ticket = SyncTicket(machine.requested);

        match machine.state {
            SyncState::Idle => {
                machine.state = SyncState::Syncing;
                machine.covering = machine.requested;
                drop(machine);

                let this = Arc::clone(self);
                tokio::spawn(async move { this.drive().await });
            }
            SyncState::Syncing => {
                machine.state = SyncState::SyncingResyncPending;
                tracing::debug!("Sync in flight, queued one trailing pass");
            }
            SyncState::SyncingResyncPending => {
                tracing::trace!("Sync request coalesced");
            }
        }

        ticket
    }

    /// Wait for the first pass covering `ticket`.
    pub async fn wait(&self, ticket: SyncTicket) -> Result<SyncReport> {
        let mut rx = self.outcomes.subscribe();
        let outcome = rx
            .wait_for(|outcome| matches!(outcome, Some(o) if o.covers >= ticket.0))
            .await
            .map_err(|_| CoreError::Sync("coordinator shut down".to_string()))?;

        match outcome.as_ref().map(|o| o.result.clone()) {
            Some(Ok(report)) => Ok(report),
            Some(Err(e)) => Err(CoreError::Sync(e)),
            None => Err(CoreError::Sync("no pass completed".to_string())),
        }
    }

    /// Request a pass and wait for it.
    pub async fn sync(self: &Arc<Self>) -> Result<SyncReport> {
        let ticket = self.request();
        self.wait(ticket).await
    }

    async fn drive(self: Arc<Self>) {
        loop {
            let covers = self.machine.lock().covering;

            // A panicking pass must not wedge the machine in Syncing
            let this = Arc::clone(&self);
            let result = match tokio::spawn(async move { this.run_pass().await }).await {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("pass aborted: {e}")),
            };

            if let Err(e) = &result {
                tracing::error!(error = %e, "Sync pass failed");
            }
            self.outcomes.send_replace(Some(PassOutcome { covers, result }));

            let mut machine = self.machine.lock();
            match machine.state {
                SyncState::SyncingResyncPending => {
                    machine.state = SyncState::Syncing;
                    machine.covering = machine.requested;
                }
                _ => {
                    machine.state = SyncState::Idle;
                    break;
                }
            }
        }
    }

    async fn run_pass(&self) -> Result<SyncReport> {
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.clock.now_ms();

        let declared: Vec<String> = self
            .store
            .get_value(Namespace::Synced, keys::BLOCKED_DOMAINS)?
            .unwrap_or_default();
        let reconciliation = self.reconciler.reconcile(&declared, now).await?;

        let pauses = PauseState::load(&self.store)?;
        let globally_paused = pauses.is_globally_paused(now);
        let active: Vec<String> = if globally_paused {
            Vec::new()
        } else {
            reconciliation
                .authorized
                .iter()
                .filter(|domain| !pauses.is_domain_paused(domain, now))
                .cloned()
                .collect()
        };

        let rules = self.compiler.compile(&active);
        let rules_installed = rules.len();

        // Only ids in our range; anything else belongs to someone else
        let stale: Vec<u32> = self
            .enforcer
            .installed_rule_ids()
            .await?
            .into_iter()
            .filter(|id| is_reserved_rule_id(*id))
            .collect();
        self.enforcer.update_rules(stale, rules).await?;

        tracing::info!(
            pass,
            declared = declared.len(),
            authorized = reconciliation.authorized.len(),
            active = active.len(),
            globally_paused,
            "Rules synced"
        );

        Ok(SyncReport {
            pass,
            declared: declared.len(),
            authorized: reconciliation.authorized,
            active,
            demoted: reconciliation.demoted,
            globally_paused,
            rules_installed,
        })
    }
}
