//! Named wake-up alarms
//!
//! Each alarm is a tokio task waiting for its wall-clock fire time. Names are
//! unique: arming an existing name replaces the previous alarm. Fired names
//! are delivered on a channel so the receiver decides what expiry means.
//!
//! Tokio's clock is monotonic and stops while the host is suspended, so a task
//! never sleeps longer than `MAX_SLEEP_SLICE` before re-reading the wall clock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;

pub const GLOBAL_SNOOZE_ALARM: &str = "snooze:global";
pub(crate) const SNOOZE_ALARM_PREFIX: &str = "snooze:";
const DOMAIN_SNOOZE_PREFIX: &str = "snooze:domain:";

const MAX_SLEEP_SLICE: Duration = Duration::from_secs(30);

pub fn domain_alarm_name(domain: &str) -> String {
    format!("{DOMAIN_SNOOZE_PREFIX}{domain}")
}

pub(crate) fn domain_from_alarm(name: &str) -> Option<&str> {
    name.strip_prefix(DOMAIN_SNOOZE_PREFIX)
        .filter(|domain| !domain.is_empty())
}

#[derive(Error, Debug)]
pub enum AlarmError {
    #[error("No async runtime to arm alarm {0}")]
    NoRuntime(String),
}

struct ArmedAlarm {
    fire_at_ms: i64,
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct AlarmService {
    clock: Arc<dyn Clock>,
    armed: Arc<Mutex<HashMap<String, ArmedAlarm>>>,
    generation: AtomicU64,
    fired: mpsc::UnboundedSender<String>,
}

impl AlarmService {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let service = Self {
            clock,
            armed: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            fired,
        };
        (service, rx)
    }

    /// Arm `name` to fire at `fire_at_ms`. A time in the past fires at once.
    pub fn arm(&self, name: &str, fire_at_ms: i64) -> Result<(), AlarmError> {
        let runtime = Handle::try_current().map_err(|_| AlarmError::NoRuntime(name.to_string()))?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);

        // Held across spawn so the task cannot look itself up before insert
        let mut armed = self.armed.lock();

        let task_name = name.to_string();
        let task_armed = Arc::clone(&self.armed);
        let clock = Arc::clone(&self.clock);
        let fired = self.fired.clone();
        let handle = runtime.spawn(async move {
            loop {
                let remaining = fire_at_ms.saturating_sub(clock.now_ms());
                if remaining <= 0 {
                    break;
                }
                let remaining = Duration::from_millis(remaining as u64);
                tokio::time::sleep(remaining.min(MAX_SLEEP_SLICE)).await;
            }
            {
                let mut armed = task_armed.lock();
                match armed.get(&task_name) {
                    Some(alarm) if alarm.generation == generation => {
                        armed.remove(&task_name);
                    }
                    _ => return,
                }
            }
            tracing::debug!(alarm = %task_name, "Alarm fired");
            let _ = fired.send(task_name);
        });

        let previous = armed.insert(
            name.to_string(),
            ArmedAlarm {
                fire_at_ms,
                generation,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }

        tracing::debug!(alarm = name, fire_at_ms, "Alarm armed");
        Ok(())
    }

    /// Returns whether an alarm was armed under `name`.
    pub fn disarm(&self, name: &str) -> bool {
        match self.armed.lock().remove(name) {
            Some(alarm) => {
                alarm.handle.abort();
                tracing::debug!(alarm = name, "Alarm disarmed");
                true
            }
            None => false,
        }
    }

    /// Disarm every alarm whose name starts with `prefix`.
    pub fn disarm_prefixed(&self, prefix: &str) -> Vec<String> {
        let mut armed = self.armed.lock();
        let names: Vec<String> = armed
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        for name in &names {
            if let Some(alarm) = armed.remove(name) {
                alarm.handle.abort();
            }
        }
        names
    }

    pub fn fire_at(&self, name: &str) -> Option<i64> {
        self.armed.lock().get(name).map(|alarm| alarm.fire_at_ms)
    }

    /// Armed alarms as (name, fire time), sorted by name.
    pub fn armed(&self) -> Vec<(String, i64)> {
        let mut out: Vec<(String, i64)> = self
            .armed
            .lock()
            .iter()
            .map(|(name, alarm)| (name.clone(), alarm.fire_at_ms))
            .collect();
        out.sort();
        out
    }
}

impl Drop for AlarmService {
    fn drop(&mut self) {
        for (_, alarm) in self.armed.lock().drain() {
            alarm.handle.abort();
        }
    }
}
