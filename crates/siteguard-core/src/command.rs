//! Command surface
//!
//! Frontends send `{"type": "<name>", ...fields}` objects and get back
//! `{"ok": true}` or `{"ok": false, "error": "..."}`. Validation happens in
//! `Command::parse`, before anything is touched.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use siteguard_policy::{is_reserved_rule_id, normalize_domain, normalize_list};
use siteguard_storage::{keys, Namespace, StateStore};

use crate::clock::Clock;
use crate::coordinator::SyncCoordinator;
use crate::snooze::{PauseState, SnoozeScheduler};
use crate::Result;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command")]
    Unknown,

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SyncRules,
    PauseForMinutes { minutes: f64 },
    ResumeNow,
    PauseDomain { domain: String, minutes: f64 },
    ResumeDomain { domain: String },
    MarkPending { domain: String },
    MarkGranted { domain: String },
    AddDomain { domain: String },
    RemoveDomain { domain: String },
    GetStatus,
}

impl Command {
    pub fn parse(request: &Value) -> std::result::Result<Self, CommandError> {
        let kind = request
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CommandError::Unknown)?;

        let command = match kind {
            "syncRules" => Command::SyncRules,
            "pauseForMinutes" => Command::PauseForMinutes {
                minutes: minutes(request)?,
            },
            "resumeNow" => Command::ResumeNow,
            "pauseDomain" => Command::PauseDomain {
                domain: domain(request)?,
                minutes: minutes(request)?,
            },
            "resumeDomain" => Command::ResumeDomain {
                domain: domain(request)?,
            },
            "markPending" => Command::MarkPending {
                domain: domain(request)?,
            },
            "markGranted" => Command::MarkGranted {
                domain: domain(request)?,
            },
            "addDomain" => Command::AddDomain {
                domain: domain(request)?,
            },
            "removeDomain" => Command::RemoveDomain {
                domain: domain(request)?,
            },
            "getStatus" => Command::GetStatus,
            _ => return Err(CommandError::Unknown),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SyncRules => "syncRules",
            Command::PauseForMinutes { .. } => "pauseForMinutes",
            Command::ResumeNow => "resumeNow",
            Command::PauseDomain { .. } => "pauseDomain",
            Command::ResumeDomain { .. } => "resumeDomain",
            Command::MarkPending { .. } => "markPending",
            Command::MarkGranted { .. } => "markGranted",
            Command::AddDomain { .. } => "addDomain",
            Command::RemoveDomain { .. } => "removeDomain",
            Command::GetStatus => "getStatus",
        }
    }
}

fn domain(request: &Value) -> std::result::Result<String, CommandError> {
    let raw = match request.get("domain").and_then(Value::as_str) {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return Err(CommandError::Invalid("domain is required".to_string())),
    };
    normalize_domain(raw).ok_or_else(|| CommandError::Invalid(format!("Invalid domain: {raw}")))
}

fn minutes(request: &Value) -> std::result::Result<f64, CommandError> {
    request
        .get("minutes")
        .and_then(Value::as_f64)
        .filter(|m| m.is_finite() && *m > 0.0)
        .ok_or_else(|| CommandError::Invalid("minutes must be a positive number".to_string()))
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            data: None,
        }
    }

    pub fn ok_with(data: Value) -> Self {
        Self {
            ok: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            data: None,
        }
    }
}

pub struct CommandRouter {
    store: StateStore,
    coordinator: Arc<SyncCoordinator>,
    scheduler: Arc<SnoozeScheduler>,
    clock: Arc<dyn Clock>,
}

impl CommandRouter {
    pub fn new(
        store: StateStore,
        coordinator: Arc<SyncCoordinator>,
        scheduler: Arc<SnoozeScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            coordinator,
            scheduler,
            clock,
        }
    }

    /// Parse and run one request. Never fails; errors become `ok: false`.
    pub async fn dispatch(&self, request: &Value) -> CommandResult {
        let command = match Command::parse(request) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected command");
                return CommandResult::err(e.to_string());
            }
        };

        let name = command.name();
        match self.execute(command).await {
            Ok(Some(data)) => CommandResult::ok_with(data),
            Ok(None) => CommandResult::ok(),
            Err(e) => {
                tracing::warn!(command = name, error = %e, "Command failed");
                CommandResult::err(e.to_string())
            }
        }
    }

    pub async fn execute(&self, command: Command) -> Result<Option<Value>> {
        tracing::debug!(command = command.name(), "Executing command");

        match command {
            Command::SyncRules => {
                self.coordinator.sync().await?;
            }
            Command::PauseForMinutes { minutes } => {
                self.scheduler.pause_all(minutes).await?;
            }
            Command::ResumeNow => {
                self.scheduler.resume_all().await?;
            }
            Command::PauseDomain { domain, minutes } => {
                self.scheduler.pause_domain(&domain, minutes).await?;
            }
            Command::ResumeDomain { domain } => {
                self.scheduler.resume_domain(&domain).await?;
            }
            Command::MarkPending { domain } => {
                let expires_at = self
                    .coordinator
                    .ledger()
                    .mark_pending(&domain, self.clock.now_ms())?;
                tracing::info!(domain = %domain, expires_at, "Grant pending");
            }
            Command::MarkGranted { domain } => {
                self.coordinator.ledger().clear(&domain)?;
                self.coordinator.sync().await?;
            }
            Command::AddDomain { domain } => {
                self.add_domain(&domain).await?;
            }
            Command::RemoveDomain { domain } => {
                self.remove_domain(&domain).await?;
            }
            Command::GetStatus => return Ok(Some(self.status().await?)),
        }
        Ok(None)
    }

    /// Insert `domain` into the blocklist and sync.
    pub async fn add_domain(&self, domain: &str) -> Result<Vec<String>> {
        let list = self.store.update(
            Namespace::Synced,
            keys::BLOCKED_DOMAINS,
            |current: Option<Vec<String>>| {
                let mut list = current.unwrap_or_default();
                list.push(domain.to_string());
                normalize_list(list)
            },
        )?;
        tracing::info!(domain, "Domain added");

        self.coordinator.sync().await?;
        Ok(list)
    }

    /// Remove `domain` from the blocklist along with its pause and pending
    /// grant, then sync.
    pub async fn remove_domain(&self, domain: &str) -> Result<Vec<String>> {
        let list = self.store.update(
            Namespace::Synced,
            keys::BLOCKED_DOMAINS,
            |current: Option<Vec<String>>| {
                normalize_list(current.unwrap_or_default())
                    .into_iter()
                    .filter(|d| d != domain)
                    .collect::<Vec<_>>()
            },
        )?;
        self.coordinator.ledger().clear(domain)?;
        tracing::info!(domain, "Domain removed");

        let pauses = PauseState::load(&self.store)?;
        if pauses.paused_domains.contains_key(domain) {
            self.scheduler.resume_domain(domain).await?;
        } else {
            self.coordinator.sync().await?;
        }
        Ok(list)
    }

    pub async fn status(&self) -> Result<Value> {
        let now = self.clock.now_ms();
        let blocked: Vec<String> = self
            .store
            .get_value(Namespace::Synced, keys::BLOCKED_DOMAINS)?
            .unwrap_or_default();
        let pending = self.coordinator.ledger().live(now)?;
        let installed = self
            .coordinator
            .enforcer()
            .installed_rule_ids()
            .await?
            .into_iter()
            .filter(|id| is_reserved_rule_id(*id))
            .count();

        let mut status = PauseState::load(&self.store)?.to_value();
        if let Some(status) = status.as_object_mut() {
            status.insert(keys::BLOCKED_DOMAINS.to_string(), json!(blocked));
            status.insert(keys::PENDING_GRANTS.to_string(), json!(pending));
            status.insert("installedRules".to_string(), json!(installed));
            status.insert(
                "syncState".to_string(),
                json!(self.coordinator.state().as_str()),
            );
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(request: Value) -> std::result::Result<Command, CommandError> {
        Command::parse(&request)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse(json!({"type": "syncRules"})), Ok(Command::SyncRules));
        assert_eq!(
            parse(json!({"type": "pauseDomain", "domain": " Example.COM ", "minutes": 2.5})),
            Ok(Command::PauseDomain {
                domain: "example.com".to_string(),
                minutes: 2.5
            })
        );
        assert_eq!(
            parse(json!({"type": "pauseForMinutes", "minutes": 10})),
            Ok(Command::PauseForMinutes { minutes: 10.0 })
        );
    }

    #[test]
    fn test_unknown_commands() {
        assert_eq!(parse(json!({"type": "nuke"})), Err(CommandError::Unknown));
        assert_eq!(parse(json!({})), Err(CommandError::Unknown));
        assert_eq!(parse(json!({"type": 3})), Err(CommandError::Unknown));
        assert_eq!(CommandError::Unknown.to_string(), "Unknown command");
    }

    #[test]
    fn test_field_validation() {
        let required = CommandError::Invalid("domain is required".to_string());
        assert_eq!(parse(json!({"type": "markPending"})), Err(required.clone()));
        assert_eq!(
            parse(json!({"type": "markGranted", "domain": "  "})),
            Err(required)
        );
        assert_eq!(
            parse(json!({"type": "resumeDomain", "domain": "https://a.com/x"})),
            Err(CommandError::Invalid(
                "Invalid domain: https://a.com/x".to_string()
            ))
        );

        for minutes in [json!(0), json!(-3), json!("5"), Value::Null] {
            assert_eq!(
                parse(json!({"type": "pauseForMinutes", "minutes": minutes})),
                Err(CommandError::Invalid(
                    "minutes must be a positive number".to_string()
                ))
            );
        }
    }

    #[test]
    fn test_result_shape() {
        assert_eq!(
            serde_json::to_value(CommandResult::ok()).unwrap(),
            json!({"ok": true})
        );
        assert_eq!(
            serde_json::to_value(CommandResult::err("Unknown command")).unwrap(),
            json!({"ok": false, "error": "Unknown command"})
        );
        assert_eq!(
            serde_json::to_value(CommandResult::ok_with(json!([1]))).unwrap(),
            json!({"ok": true, "data": [1]})
        );
    }
}
