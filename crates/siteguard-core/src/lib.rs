//! SiteGuard Core
//!
//! Reconciles the declared blocklist, snooze windows and host grants into
//! the installed redirect rules. `Engine` owns every component; frontends
//! talk to it through `CommandRouter`.

mod alarms;
mod clock;
mod command;
mod config;
mod coordinator;
mod engine;
mod error;
mod snooze;
mod watcher;

pub use alarms::{domain_alarm_name, AlarmError, AlarmService, GLOBAL_SNOOZE_ALARM};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, CommandError, CommandResult, CommandRouter};
pub use config::Config;
pub use coordinator::{SyncCoordinator, SyncReport, SyncState, SyncTicket};
pub use engine::Engine;
pub use error::CoreError;
pub use snooze::{PauseState, RestoreSummary, SnoozeScheduler, MAX_PAUSE_MINUTES};
pub use watcher::spawn_change_watcher;

// Re-export the pieces frontends need to assemble an engine
pub use siteguard_policy::{
    CapabilitySystem, CompiledRule, EnforcementLayer, GrantTable, InMemoryEnforcer,
    ResourceType, RetryPolicy,
};
pub use siteguard_storage::{Database, Namespace, StateStore, StorageError};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging. Output goes to stderr so stdout stays free for replies.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
