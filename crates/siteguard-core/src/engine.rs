//! Engine
//!
//! Owns every component and the background tasks that drive them. Frontends
//! construct one engine, call `start` once, then feed it commands.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use siteguard_policy::{
    CapabilitySystem, EnforcementLayer, PendingGrantLedger, PermissionOracle,
    PermissionReconciler, RuleCompiler,
};
use siteguard_storage::{Database, StateStore};

use crate::alarms::AlarmService;
use crate::clock::{Clock, SystemClock};
use crate::command::{Command, CommandResult, CommandRouter};
use crate::config::Config;
use crate::coordinator::{SyncCoordinator, SyncReport};
use crate::error::CoreError;
use crate::snooze::SnoozeScheduler;
use crate::watcher::spawn_change_watcher;
use crate::Result;

pub struct Engine {
    /// Configuration
    config: Config,
    /// Persisted state
    store: StateStore,
    alarms: Arc<AlarmService>,
    coordinator: Arc<SyncCoordinator>,
    scheduler: Arc<SnoozeScheduler>,
    router: CommandRouter,
    /// Fired alarm names, taken by `start`
    fired: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// Alarm dispatcher and change watcher
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: Config,
        db: Database,
        capabilities: Arc<dyn CapabilitySystem>,
        enforcer: Arc<dyn EnforcementLayer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = StateStore::new(db);

        let reconciler = PermissionReconciler::new(
            store.clone(),
            PermissionOracle::with_retry(capabilities, config.oracle_retry),
            PendingGrantLedger::with_ttl(store.clone(), config.pending_grant_ttl_ms),
        );
        let compiler = RuleCompiler::new(&config.blocked_page)?;
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            reconciler,
            compiler,
            enforcer,
            clock.clone(),
        ));

        let (alarms, fired) = AlarmService::new(clock.clone());
        let alarms = Arc::new(alarms);
        let scheduler = Arc::new(SnoozeScheduler::new(
            store.clone(),
            alarms.clone(),
            coordinator.clone(),
            clock.clone(),
        ));
        let router = CommandRouter::new(
            store.clone(),
            coordinator.clone(),
            scheduler.clone(),
            clock,
        );

        Ok(Self {
            config,
            store,
            alarms,
            coordinator,
            scheduler,
            router,
            fired: Mutex::new(Some(fired)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open the configured database and build an engine on the system clock.
    pub fn open(
        config: Config,
        capabilities: Arc<dyn CapabilitySystem>,
        enforcer: Arc<dyn EnforcementLayer>,
    ) -> Result<Self> {
        let db = if config.is_in_memory() {
            Database::open_in_memory()?
        } else {
            // Ensure data directory exists
            if let Some(parent) = config.database_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Database::open(&config.database_path)?
        };

        tracing::info!(database = %config.database_path.display(), "Database opened");
        Self::new(config, db, capabilities, enforcer, Arc::new(SystemClock))
    }

    /// Spawn the background tasks, restore snooze alarms and run the first
    /// pass. Must be called once, inside a tokio runtime. A failed restore is
    /// logged; the returned error only reflects the first pass.
    pub async fn start(&self) -> Result<SyncReport> {
        let mut fired = self
            .fired
            .lock()
            .take()
            .ok_or_else(|| CoreError::Invalid("Engine already started".to_string()))?;

        let scheduler = self.scheduler.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(name) = fired.recv().await {
                if let Err(e) = scheduler.handle_alarm(&name).await {
                    tracing::error!(alarm = %name, error = %e, "Alarm handling failed");
                }
            }
        });

        let watcher = spawn_change_watcher(
            &self.store,
            self.coordinator.clone(),
            Duration::from_millis(self.config.debounce_ms),
        );
        self.tasks.lock().extend([dispatcher, watcher]);

        // Pauses that cannot be restored must not keep enforcement down
        if let Err(e) = self.scheduler.restore() {
            tracing::error!(error = %e, "Failed to restore snooze alarms");
        }
        let report = self.coordinator.sync().await?;

        tracing::info!(active = report.active.len(), "Engine started");
        Ok(report)
    }

    pub async fn dispatch(&self, request: &Value) -> CommandResult {
        self.router.dispatch(request).await
    }

    pub async fn execute(&self, command: Command) -> Result<Option<Value>> {
        self.router.execute(command).await
    }

    pub async fn sync(&self) -> Result<SyncReport> {
        self.coordinator.sync().await
    }

    pub async fn add_domain(&self, domain: &str) -> Result<Vec<String>> {
        self.router.add_domain(domain).await
    }

    pub async fn remove_domain(&self, domain: &str) -> Result<Vec<String>> {
        self.router.remove_domain(domain).await
    }

    pub async fn status(&self) -> Result<Value> {
        self.router.status().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn alarms(&self) -> &AlarmService {
        &self.alarms
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &SnoozeScheduler {
        &self.scheduler
    }

    /// Stop the background tasks. Persisted state is left as is.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
