//! Snooze scheduling
//!
//! Pauses are persisted first and then backed by an alarm, so a restart can
//! rebuild the alarms from storage. An alarm firing only clears the pause it
//! stands for; the following sync reinstates the rules.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use siteguard_storage::{keys, Namespace, StateStore};

use crate::alarms::{
    domain_alarm_name, domain_from_alarm, AlarmService, GLOBAL_SNOOZE_ALARM, SNOOZE_ALARM_PREFIX,
};
use crate::clock::Clock;
use crate::coordinator::SyncCoordinator;
use crate::error::CoreError;
use crate::Result;

const MS_PER_MINUTE: f64 = 60_000.0;

/// Longest accepted pause: one year.
pub const MAX_PAUSE_MINUTES: f64 = 525_600.0;

/// Persisted pause windows, as epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseState {
    pub paused_until: i64,
    pub paused_domains: BTreeMap<String, i64>,
}

impl PauseState {
    /// Load the pause windows. Values another writer left in a shape we
    /// cannot read are skipped: a bad `pausedUntilTs` counts as no pause and
    /// bad `pausedDomains` entries are dropped.
    pub fn load(store: &StateStore) -> Result<Self> {
        Self::load_checked(store).map(|(state, _)| state)
    }

    /// Like `load`, also naming every value that was skipped.
    fn load_checked(store: &StateStore) -> Result<(Self, Vec<String>)> {
        let mut raw = store.get(
            Namespace::Local,
            &[keys::PAUSED_UNTIL_TS, keys::PAUSED_DOMAINS],
        )?;
        let mut rejected = Vec::new();

        let paused_until = match raw.remove(keys::PAUSED_UNTIL_TS) {
            None | Some(Value::Null) => 0,
            Some(value) => timestamp(&value).unwrap_or_else(|| {
                rejected.push(keys::PAUSED_UNTIL_TS.to_string());
                0
            }),
        };
        let paused_domains = domain_pauses(raw.get(keys::PAUSED_DOMAINS), &mut rejected);

        for key in &rejected {
            tracing::warn!(key = %key, "Ignoring malformed pause value");
        }
        Ok((
            Self {
                paused_until,
                paused_domains,
            },
            rejected,
        ))
    }

    pub fn is_globally_paused(&self, now_ms: i64) -> bool {
        self.paused_until > now_ms
    }

    pub fn is_domain_paused(&self, domain: &str, now_ms: i64) -> bool {
        self.paused_domains
            .get(domain)
            .is_some_and(|until| *until > now_ms)
    }

    /// The pause state as the JSON object status replies carry.
    pub(crate) fn to_value(&self) -> Value {
        json!({
            "pausedUntilTs": self.paused_until,
            "pausedDomains": self.paused_domains,
        })
    }
}

fn timestamp(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|ms| ms.is_finite() && ms.abs() < i64::MAX as f64)
            .map(|ms| ms.round() as i64)
    })
}

/// Decode a `pausedDomains` object, pushing the names of unreadable entries
/// onto `rejected`.
fn domain_pauses(value: Option<&Value>, rejected: &mut Vec<String>) -> BTreeMap<String, i64> {
    let entries = match value {
        None | Some(Value::Null) => return BTreeMap::new(),
        Some(Value::Object(entries)) => entries,
        Some(_) => {
            rejected.push(keys::PAUSED_DOMAINS.to_string());
            return BTreeMap::new();
        }
    };

    entries
        .iter()
        .filter_map(|(domain, until)| match timestamp(until) {
            Some(until) => Some((domain.clone(), until)),
            None => {
                rejected.push(format!("{}.{domain}", keys::PAUSED_DOMAINS));
                None
            }
        })
        .collect()
}

/// What `restore` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub rearmed: Vec<String>,
    pub disarmed: Vec<String>,
    pub purged: Vec<String>,
    pub failed: Vec<String>,
    /// Persisted values dropped because they did not decode
    pub discarded: Vec<String>,
}

pub struct SnoozeScheduler {
    store: StateStore,
    alarms: Arc<AlarmService>,
    coordinator: Arc<SyncCoordinator>,
    clock: Arc<dyn Clock>,
}

impl SnoozeScheduler {
    pub fn new(
        store: StateStore,
        alarms: Arc<AlarmService>,
        coordinator: Arc<SyncCoordinator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            alarms,
            coordinator,
            clock,
        }
    }

    /// Pause every rule for `minutes`. Returns the pause end.
    pub async fn pause_all(&self, minutes: f64) -> Result<i64> {
        let until = self.until(minutes)?;
        self.store
            .set_value(Namespace::Local, keys::PAUSED_UNTIL_TS, &until)?;
        self.alarms.arm(GLOBAL_SNOOZE_ALARM, until)?;
        tracing::info!(until, "Blocking paused");

        self.coordinator.sync().await?;
        Ok(until)
    }

    /// Pause a single domain for `minutes`. Returns the pause end.
    pub async fn pause_domain(&self, domain: &str, minutes: f64) -> Result<i64> {
        let until = self.until(minutes)?;
        self.update_domain_pauses(|paused| {
            paused.insert(domain.to_string(), until);
        })?;
        self.alarms.arm(&domain_alarm_name(domain), until)?;
        tracing::info!(domain, until, "Domain paused");

        self.coordinator.sync().await?;
        Ok(until)
    }

    /// Clear every pause, global and per-domain.
    pub async fn resume_all(&self) -> Result<()> {
        let mut cleared = Map::new();
        cleared.insert(keys::PAUSED_UNTIL_TS.to_string(), json!(0));
        cleared.insert(keys::PAUSED_DOMAINS.to_string(), json!({}));
        self.store.set(Namespace::Local, cleared)?;

        let disarmed = self.alarms.disarm_prefixed(SNOOZE_ALARM_PREFIX);
        tracing::info!(alarms = disarmed.len(), "Blocking resumed");

        self.coordinator.sync().await?;
        Ok(())
    }

    /// Clear the global pause only; per-domain pauses keep running.
    pub async fn resume_global(&self) -> Result<()> {
        self.store
            .set_value(Namespace::Local, keys::PAUSED_UNTIL_TS, &0)?;
        self.alarms.disarm(GLOBAL_SNOOZE_ALARM);
        tracing::info!("Global pause ended");

        self.coordinator.sync().await?;
        Ok(())
    }

    pub async fn resume_domain(&self, domain: &str) -> Result<()> {
        self.drop_domain_pause(domain)?;
        self.alarms.disarm(&domain_alarm_name(domain));
        tracing::info!(domain, "Domain pause ended");

        self.coordinator.sync().await?;
        Ok(())
    }

    /// React to a fired alarm.
    pub async fn handle_alarm(&self, name: &str) -> Result<()> {
        // Re-armed between firing and delivery
        if self.alarms.fire_at(name).is_some() {
            tracing::debug!(alarm = name, "Ignoring stale alarm");
            return Ok(());
        }

        if name == GLOBAL_SNOOZE_ALARM {
            return self.resume_global().await;
        }
        match domain_from_alarm(name) {
            Some(domain) => self.resume_domain(domain).await,
            None => {
                tracing::warn!(alarm = name, "Unknown alarm");
                Ok(())
            }
        }
    }

    /// Bring the armed alarms in line with the persisted pauses after a
    /// restart. Expired pauses are purged; failures to arm are logged and
    /// skipped.
    pub fn restore(&self) -> Result<RestoreSummary> {
        let now = self.clock.now_ms();
        let (pauses, rejected) = PauseState::load_checked(&self.store)?;
        let mut summary = RestoreSummary::default();

        let until_rejected = rejected.iter().any(|key| key == keys::PAUSED_UNTIL_TS);
        let domains_rejected = rejected.iter().any(|key| key != keys::PAUSED_UNTIL_TS);

        let mut wanted: BTreeMap<String, i64> = BTreeMap::new();
        if pauses.is_globally_paused(now) {
            wanted.insert(GLOBAL_SNOOZE_ALARM.to_string(), pauses.paused_until);
        } else if pauses.paused_until != 0 || until_rejected {
            self.store
                .set_value(Namespace::Local, keys::PAUSED_UNTIL_TS, &0)?;
            if pauses.paused_until != 0 {
                summary.purged.push(GLOBAL_SNOOZE_ALARM.to_string());
            }
        }

        let expired: BTreeSet<String> = pauses
            .paused_domains
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(domain, _)| domain.clone())
            .collect();
        for (domain, until) in &pauses.paused_domains {
            if !expired.contains(domain) {
                wanted.insert(domain_alarm_name(domain), *until);
            }
        }
        if !expired.is_empty() || domains_rejected {
            self.update_domain_pauses(|paused| {
                paused.retain(|domain, _| !expired.contains(domain));
            })?;
            summary
                .purged
                .extend(expired.iter().map(|domain| domain_alarm_name(domain)));
        }
        summary.discarded = rejected;

        let armed: BTreeMap<String, i64> = self
            .alarms
            .armed()
            .into_iter()
            .filter(|(name, _)| name.starts_with(SNOOZE_ALARM_PREFIX))
            .collect();

        for name in armed.keys() {
            if !wanted.contains_key(name) {
                self.alarms.disarm(name);
                summary.disarmed.push(name.clone());
            }
        }
        for (name, until) in &wanted {
            if armed.get(name) == Some(until) {
                continue;
            }
            match self.alarms.arm(name, *until) {
                Ok(()) => summary.rearmed.push(name.clone()),
                Err(e) => {
                    tracing::warn!(alarm = %name, error = %e, "Failed to re-arm alarm");
                    summary.failed.push(name.clone());
                }
            }
        }

        tracing::info!(
            rearmed = summary.rearmed.len(),
            disarmed = summary.disarmed.len(),
            purged = summary.purged.len(),
            failed = summary.failed.len(),
            discarded = summary.discarded.len(),
            "Snooze alarms restored"
        );
        Ok(summary)
    }

    fn until(&self, minutes: f64) -> Result<i64> {
        if !minutes.is_finite() || minutes <= 0.0 {
            return Err(CoreError::Invalid(
                "minutes must be a positive number".to_string(),
            ));
        }
        if minutes > MAX_PAUSE_MINUTES {
            return Err(CoreError::Invalid(format!(
                "minutes must be at most {MAX_PAUSE_MINUTES}"
            )));
        }
        let duration_ms = (minutes * MS_PER_MINUTE).round() as i64;
        self.clock
            .now_ms()
            .checked_add(duration_ms)
            .ok_or_else(|| CoreError::Invalid("pause ends too far in the future".to_string()))
    }

    fn drop_domain_pause(&self, domain: &str) -> Result<()> {
        if PauseState::load(&self.store)?
            .paused_domains
            .contains_key(domain)
        {
            self.update_domain_pauses(|paused| {
                paused.remove(domain);
            })?;
        }
        Ok(())
    }

    /// Read-modify-write of `pausedDomains`. Unreadable entries are dropped.
    fn update_domain_pauses<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, i64>),
    {
        self.store.update(
            Namespace::Local,
            keys::PAUSED_DOMAINS,
            |current: Option<Value>| {
                let mut paused = domain_pauses(current.as_ref(), &mut Vec::new());
                f(&mut paused);
                Value::Object(
                    paused
                        .into_iter()
                        .map(|(domain, until)| (domain, Value::from(until)))
                        .collect(),
                )
            },
        )?;
        Ok(())
    }
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

    struct Fixture {
        store: StateStore,
        clock: Arc<ManualClock>,
        alarms: Arc<AlarmService>,
        enforcer: Arc<InMemoryEnforcer>,
        scheduler: SnoozeScheduler,
    }

    fn fixture() -> Fixture {
        let store = StateStore::new(Database::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let enforcer = Arc::new(InMemoryEnforcer::new());
        let reconciler = PermissionReconciler::new(
            store.clone(),
            PermissionOracle::new(Arc::new(GrantTable::with_grants([ALL_URLS]))),
            PendingGrantLedger::new(store.clone()),
        );
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            reconciler,
            RuleCompiler::new("ext://siteguard/blocked.html").unwrap(),
            enforcer.clone(),
            clock.clone(),
        ));
        let (alarms, _fired) = AlarmService::new(clock.clone());
        let alarms = Arc::new(alarms);
        let scheduler =
            SnoozeScheduler::new(store.clone(), alarms.clone(), coordinator, clock.clone());

        store
            .set_value(
                Namespace::Synced,
                keys::BLOCKED_DOMAINS,
                &vec!["a.com", "b.com"],
            )
            .unwrap();

        Fixture {
            store,
            clock,
            alarms,
            enforcer,
            scheduler,
        }
    }

    #[test]
    fn test_pause_state_windows() {
        let state = PauseState {
            paused_until: 2_000,
            paused_domains: BTreeMap::from([("a.com".to_string(), 1_500)]),
        };
        assert!(state.is_globally_paused(1_999));
        assert!(!state.is_globally_paused(2_000));
        assert!(state.is_domain_paused("a.com", 1_000));
        assert!(!state.is_domain_paused("a.com", 1_500));
        assert!(!state.is_domain_paused("b.com", 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_all_lifts_every_rule() {
        let f = fixture();

        let until = f.scheduler.pause_all(5.0).await.unwrap();
        assert_eq!(until, 1_000_000 + 300_000);
        assert_eq!(f.alarms.fire_at(GLOBAL_SNOOZE_ALARM), Some(until));
        assert_eq!(f.enforcer.rule_count(), 0);

        f.scheduler.resume_all().await.unwrap();
        assert!(f.alarms.armed().is_empty());
        assert_eq!(f.enforcer.rule_count(), 2);
        assert_eq!(PauseState::load(&f.store).unwrap(), PauseState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_domain_lifts_one_rule() {
        let f = fixture();

        f.scheduler.pause_domain("a.com", 1.0).await.unwrap();
        assert!(!f.enforcer.blocks("https://a.com/"));
        assert!(f.enforcer.blocks("https://b.com/"));

        let pauses = PauseState::load(&f.store).unwrap();
        assert_eq!(pauses.paused_domains.get("a.com"), Some(&(1_000_000 + 60_000)));
        assert!(!pauses.is_globally_paused(f.clock.now_ms()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_domain_alarm_expiry_reinstates_rule() {
        let f = fixture();
        f.scheduler.pause_domain("a.com", 1.0).await.unwrap();

        let name = domain_alarm_name("a.com");
        f.alarms.disarm(&name);
        f.clock.advance(60_000);
        f.scheduler.handle_alarm(&name).await.unwrap();

        assert!(f.enforcer.blocks("https://a.com/"));
        assert!(PauseState::load(&f.store)
            .unwrap()
            .paused_domains
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_expiry_keeps_domain_pauses() {
        let f = fixture();
        f.scheduler.pause_domain("a.com", 30.0).await.unwrap();
        f.scheduler.pause_all(5.0).await.unwrap();

        f.alarms.disarm(GLOBAL_SNOOZE_ALARM);
        f.clock.advance(300_000);
        f.scheduler.handle_alarm(GLOBAL_SNOOZE_ALARM).await.unwrap();

        assert!(!f.enforcer.blocks("https://a.com/"));
        assert!(f.enforcer.blocks("https://b.com/"));
        assert!(f.alarms.fire_at(&domain_alarm_name("a.com")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_alarm_is_ignored() {
        let f = fixture();
        f.scheduler.pause_all(5.0).await.unwrap();

        // Still armed, so this delivery is from an earlier arming
        f.scheduler.handle_alarm(GLOBAL_SNOOZE_ALARM).await.unwrap();
        assert!(PauseState::load(&f.store).unwrap().is_globally_paused(f.clock.now_ms()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_non_positive_minutes() {
        let f = fixture();
        for minutes in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                f.scheduler.pause_all(minutes).await,
                Err(CoreError::Invalid(_))
            ));
        }
        assert!(f.alarms.armed().is_empty());
        assert_eq!(PauseState::load(&f.store).unwrap(), PauseState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_rebuilds_alarms_from_storage() {
        let f = fixture();
        let now = f.clock.now_ms();
        f.store
            .set_value(Namespace::Local, keys::PAUSED_UNTIL_TS, &(now + 60_000))
            .unwrap();
        f.store
            .set_value(
                Namespace::Local,
                keys::PAUSED_DOMAINS,
                &BTreeMap::from([
                    ("a.com".to_string(), now + 300_000),
                    ("old.com".to_string(), now - 1),
                ]),
            )
            .unwrap();
        f.alarms.arm("snooze:domain:gone.com", now + 10_000).unwrap();

        let summary = f.scheduler.restore().unwrap();

        assert_eq!(
            summary.rearmed,
            vec![domain_alarm_name("a.com"), GLOBAL_SNOOZE_ALARM.to_string()]
        );
        assert_eq!(summary.disarmed, vec!["snooze:domain:gone.com".to_string()]);
        assert_eq!(summary.purged, vec![domain_alarm_name("old.com")]);
        assert!(summary.failed.is_empty());

        assert_eq!(f.alarms.fire_at(&domain_alarm_name("a.com")), Some(now + 300_000));
        let pauses = PauseState::load(&f.store).unwrap();
        assert!(!pauses.paused_domains.contains_key("old.com"));

        // A second restore has nothing to do
        let again = f.scheduler.restore().unwrap();
        assert_eq!(again, RestoreSummary::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_clears_expired_global_pause() {
        let f = fixture();
        f.store
            .set_value(Namespace::Local, keys::PAUSED_UNTIL_TS, &(f.clock.now_ms() - 1))
            .unwrap();

        let summary = f.scheduler.restore().unwrap();
        assert_eq!(summary.purged, vec![GLOBAL_SNOOZE_ALARM.to_string()]);
        assert_eq!(PauseState::load(&f.store).unwrap().paused_until, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_pauses_beyond_the_maximum() {
        let f = fixture();
        for minutes in [1e300, f64::MAX, MAX_PAUSE_MINUTES + 1.0] {
            assert!(matches!(
                f.scheduler.pause_all(minutes).await,
                Err(CoreError::Invalid(_))
            ));
            assert!(matches!(
                f.scheduler.pause_domain("a.com", minutes).await,
                Err(CoreError::Invalid(_))
            ));
        }
        assert!(f.alarms.armed().is_empty());
        assert_eq!(PauseState::load(&f.store).unwrap(), PauseState::default());

        let until = f.scheduler.pause_all(MAX_PAUSE_MINUTES).await.unwrap();
        assert_eq!(until, f.clock.now_ms() + 525_600 * 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_pause_values_are_skipped() {
        let f = fixture();
        let now = f.clock.now_ms();
        f.store
            .set_value(Namespace::Local, keys::PAUSED_UNTIL_TS, &"tomorrow")
            .unwrap();
        f.store
            .set_value(
                Namespace::Local,
                keys::PAUSED_DOMAINS,
                &json!({"x.com": "soon", "a.com": now + 300_000}),
            )
            .unwrap();

        let pauses = PauseState::load(&f.store).unwrap();
        assert_eq!(pauses.paused_until, 0);
        assert_eq!(
            pauses.paused_domains,
            BTreeMap::from([("a.com".to_string(), now + 300_000)])
        );

        let summary = f.scheduler.restore().unwrap();
        assert_eq!(summary.rearmed, vec![domain_alarm_name("a.com")]);
        assert_eq!(
            summary.discarded,
            vec![
                keys::PAUSED_UNTIL_TS.to_string(),
                "pausedDomains.x.com".to_string()
            ]
        );

        // The bad values are gone from storage
        let stored: Value = f
            .store
            .get_value(Namespace::Local, keys::PAUSED_DOMAINS)
            .unwrap()
            .unwrap();
        assert_eq!(stored, json!({"a.com": now + 300_000}));
        let until: i64 = f
            .store
            .get_value(Namespace::Local, keys::PAUSED_UNTIL_TS)
            .unwrap()
            .unwrap();
        assert_eq!(until, 0);

        // Passes keep working
        f.scheduler.resume_domain("a.com").await.unwrap();
        assert!(f.enforcer.blocks("https://a.com/"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_object_domain_pauses_are_replaced() {
        let f = fixture();
        f.store
            .set_value(Namespace::Local, keys::PAUSED_DOMAINS, &"garbage")
            .unwrap();

        let until = f.scheduler.pause_domain("b.com", 1.0).await.unwrap();
        let pauses = PauseState::load(&f.store).unwrap();
        assert_eq!(
            pauses.paused_domains,
            BTreeMap::from([("b.com".to_string(), until)])
        );
        assert!(!f.enforcer.blocks("https://b.com/"));
    }
}
