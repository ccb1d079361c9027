//! Namespaced key/value state
//!
//! The synced namespace holds the user's declared blocklist, the local
//! namespace holds runtime state (pauses, pending grants). Both share one
//! table and one API; every committed write is announced on a broadcast
//! channel so other components can react to edits made elsewhere.

use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::database::Database;
use crate::error::StorageError;
use crate::Result;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Well-known keys
pub mod keys {
    /// Synced: sorted, deduplicated `string[]`
    pub const BLOCKED_DOMAINS: &str = "blockedDomains";
    /// Local: epoch millis, `0` or absent means not paused
    pub const PAUSED_UNTIL_TS: &str = "pausedUntilTs";
    /// Local: `{domain: epoch millis}`
    pub const PAUSED_DOMAINS: &str = "pausedDomains";
    /// Local: `{domain: epoch millis}`
    pub const PENDING_GRANTS: &str = "pendingGrants";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Synced,
    Local,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Synced => "synced",
            Namespace::Local => "local",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Namespace {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synced" | "sync" => Ok(Namespace::Synced),
            "local" => Ok(Namespace::Local),
            _ => Err(StorageError::UnknownNamespace(s.to_string())),
        }
    }
}

/// Emitted after a write commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub namespace: Namespace,
    pub keys: Vec<String>,
}

impl StorageChange {
    pub fn touches(&self, namespace: Namespace, key: &str) -> bool {
        self.namespace == namespace && self.keys.iter().any(|k| k == key)
    }
}

pub struct StateStore {
    db: Database,
    changes: broadcast::Sender<StorageChange>,
}

impl StateStore {
    pub fn new(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { db, changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    /// Fetch the requested keys. Absent keys are omitted from the result.
    pub fn get(&self, namespace: Namespace, keys: &[&str]) -> Result<Map<String, Value>> {
        self.db.with_connection(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT value FROM kv WHERE namespace = ?1 AND key = ?2")?;
            let mut out = Map::new();

            for key in keys {
                let raw: Option<String> = stmt
                    .query_row(rusqlite::params![namespace.as_str(), key], |row| row.get(0))
                    .optional()?;
                if let Some(raw) = raw {
                    out.insert((*key).to_string(), serde_json::from_str(&raw)?);
                }
            }

            Ok(out)
        })
    }

    pub fn get_value<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Result<Option<T>> {
        match self.get(namespace, &[key])?.remove(key) {
            Some(value) => decode(namespace, key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Write every key in `partial` in one transaction.
    pub fn set(&self, namespace: Namespace, partial: Map<String, Value>) -> Result<()> {
        if partial.is_empty() {
            return Ok(());
        }

        let updated_at = Utc::now().to_rfc3339();
        self.db.transaction(|tx| {
            for (key, value) in &partial {
                tx.execute(
                    "INSERT OR REPLACE INTO kv (namespace, key, value, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        namespace.as_str(),
                        key,
                        serde_json::to_string(value)?,
                        updated_at
                    ],
                )?;
            }
            Ok(())
        })?;

        self.notify(namespace, partial.keys().cloned().collect());
        Ok(())
    }

    pub fn set_value<T: Serialize>(&self, namespace: Namespace, key: &str, value: &T) -> Result<()> {
        let mut partial = Map::new();
        partial.insert(key.to_string(), serde_json::to_value(value)?);
        self.set(namespace, partial)
    }

    pub fn remove(&self, namespace: Namespace, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        self.db.transaction(|tx| {
            for key in keys {
                tx.execute(
                    "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
                    rusqlite::params![namespace.as_str(), key],
                )?;
            }
            Ok(())
        })?;

        self.notify(namespace, keys.iter().map(|k| k.to_string()).collect());
        Ok(())
    }

    /// Atomic read-modify-write of a single key.
    ///
    /// `f` receives the current value (if any) and returns the replacement.
    /// Nothing is written, and no change is announced, when the replacement
    /// serializes identically to what is stored.
    pub fn update<T, F>(&self, namespace: Namespace, key: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let updated_at = Utc::now().to_rfc3339();
        let (value, changed) = self.db.transaction(|tx| {
            let raw: Option<String> = tx
                .query_row(
                    "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                    rusqlite::params![namespace.as_str(), key],
                    |row| row.get(0),
                )
                .optional()?;

            let current = match raw.as_deref() {
                Some(raw) => Some(decode(namespace, key, serde_json::from_str(raw)?)?),
                None => None,
            };

            let next = f(current);
            let encoded = serde_json::to_string(&next)?;
            if raw.as_deref() == Some(encoded.as_str()) {
                return Ok((next, false));
            }

            tx.execute(
                "INSERT OR REPLACE INTO kv (namespace, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![namespace.as_str(), key, encoded, updated_at],
            )?;
            Ok((next, true))
        })?;

        if changed {
            self.notify(namespace, vec![key.to_string()]);
        }
        Ok(value)
    }

    fn notify(&self, namespace: Namespace, keys: Vec<String>) {
        tracing::trace!(%namespace, ?keys, "State changed");
        // No subscribers is fine
        let _ = self.changes.send(StorageChange { namespace, keys });
    }
}

impl Clone for StateStore {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            changes: self.changes.clone(),
        }
    }
}

fn decode<T: DeserializeOwned>(namespace: Namespace, key: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| StorageError::MalformedValue {
        namespace: namespace.to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}
