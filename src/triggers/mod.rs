//! Backup triggers
//!
//! A trigger decides *when* a managed file is backed up. Each one is bound to a
//! file through a [`TriggerContext`] carrying the file's path, the shared
//! [`EventBus`] and a backup callback, and runs as its own tokio task until it
//! is unregistered.
//!
//! ## Taxonomy
//!
//! | Trigger | Fires |
//! |---------|-------|
//! | [`IntervalTrigger`] | every fixed period, first firing one period after registration |
//! | [`ScheduledTimeTrigger`] | at a local time of day, optionally on one weekday |
//! | [`OnSaveTrigger`] | on every `FileSaved` event for the file |
//! | [`OnModifiedTrigger`] | once saves have been quiet for a period |
//! | [`OnStartupTrigger`] | once, after a delay, the first time it is registered |
//! | [`RemoteSyncTrigger`] | polls the remote and syncs instead of backing up |
//! | [`CombinedTrigger`] | registers a list of triggers together |
//!
//! ## Lifecycle
//!
//! `register` and `unregister` are idempotent. Unregistering aborts the spawned
//! task, so once it returns no further firing happens. A failing backup
//! callback is logged and the trigger keeps running.
//!
//! ## Configuration
//!
//! [`TriggerConfig`] describes the non-remote triggers in serde form:
//!
//! ```rust
//! use safekeep::triggers::{BackupTrigger, TriggerConfig};
//!
//! let config: TriggerConfig = serde_json::from_str(r#"{"kind":"interval","every":"1h"}"#).unwrap();
//! assert!(config.validate().is_ok());
//! let trigger = config.build();
//! assert_eq!(trigger.name(), "interval");
//! assert!(!trigger.is_active());
//! ```

mod combined;
mod interval;
mod on_modified;
mod on_save;
mod on_startup;
mod remote_sync;
mod scheduled;

pub use combined::CombinedTrigger;
pub use interval::IntervalTrigger;
pub use on_modified::OnModifiedTrigger;
pub use on_save::OnSaveTrigger;
pub use on_startup::OnStartupTrigger;
pub use remote_sync::RemoteSyncTrigger;
pub use scheduled::{next_occurrence, ScheduledTimeTrigger};

use crate::error::{Result, SafekeepError};
use crate::events::EventBus;
use crate::types::humantime_duration;
use chrono::{NaiveTime, Weekday};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Future returned by a backup callback
pub type BackupFuture = BoxFuture<'static, Result<PathBuf>>;

/// Callback a trigger invokes to back up its file
pub type BackupCallback = Arc<dyn Fn() -> BackupFuture + Send + Sync>;

/// Everything a trigger needs to act on one managed file
#[derive(Clone)]
pub struct TriggerContext {
    /// Managed file path
    pub path: PathBuf,
    /// Bus carrying `FileSaved` events
    pub events: EventBus,
    /// Backup action
    pub callback: BackupCallback,
}

impl std::fmt::Debug for TriggerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerContext")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TriggerContext {
    /// Create a context
    pub fn new(path: impl Into<PathBuf>, events: EventBus, callback: BackupCallback) -> Self {
        Self {
            path: path.into(),
            events,
            callback,
        }
    }

    /// Run the backup callback, logging instead of propagating failures
    pub(crate) async fn fire(&self, trigger: &str) {
        match (self.callback)().await {
            Ok(backup) => debug!("{} trigger backed up {:?} to {:?}", trigger, self.path, backup),
            Err(e) => warn!("{} trigger failed to back up {:?}: {}", trigger, self.path, e),
        }
    }
}

/// Common lifecycle of every trigger
pub trait BackupTrigger: Send + Sync {
    /// Bind the trigger to a file and start it (no-op if already active)
    fn register(&self, ctx: TriggerContext);

    /// Stop the trigger (no-op if not active)
    fn unregister(&self);

    /// Whether the trigger is currently registered
    fn is_active(&self) -> bool;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Slot holding the task of a registered trigger
#[derive(Debug, Default)]
pub(crate) struct TaskSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    /// Spawn `task` unless one is already held; returns whether it spawned
    pub(crate) fn start<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return false;
        }
        *handle = Some(tokio::spawn(task));
        true
    }

    /// Abort the held task; returns whether one was held
    pub(crate) fn stop(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// One trigger of the fixed taxonomy
#[derive(Debug)]
pub enum Trigger {
    Interval(IntervalTrigger),
    ScheduledTime(ScheduledTimeTrigger),
    OnSave(OnSaveTrigger),
    OnModified(OnModifiedTrigger),
    OnStartup(OnStartupTrigger),
    RemoteSync(RemoteSyncTrigger),
    Combined(CombinedTrigger),
}

impl Trigger {
    /// Fire every `period`
    pub fn interval(period: Duration) -> Self {
        Trigger::Interval(IntervalTrigger::new(period))
    }

    /// Fire every day at a local time
    pub fn daily_at(time: NaiveTime) -> Self {
        Trigger::ScheduledTime(ScheduledTimeTrigger::new(time, None))
    }

    /// Fire every week on `weekday` at a local time
    pub fn weekly_at(weekday: Weekday, time: NaiveTime) -> Self {
        Trigger::ScheduledTime(ScheduledTimeTrigger::new(time, Some(weekday)))
    }

    /// Fire on every save
    pub fn on_save() -> Self {
        Trigger::OnSave(OnSaveTrigger::new())
    }

    /// Fire once saves have been quiet for `quiet_period`
    pub fn on_modified(quiet_period: Duration) -> Self {
        Trigger::OnModified(OnModifiedTrigger::new(quiet_period))
    }

    /// Fire once, `delay` after the first registration
    pub fn on_startup(delay: Duration) -> Self {
        Trigger::OnStartup(OnStartupTrigger::new(delay))
    }

    /// Register several triggers as one
    pub fn combined(triggers: Vec<Trigger>) -> Self {
        Trigger::Combined(CombinedTrigger::new(triggers))
    }

    fn as_dyn(&self) -> &dyn BackupTrigger {
        match self {
            Trigger::Interval(t) => t,
            Trigger::ScheduledTime(t) => t,
            Trigger::OnSave(t) => t,
            Trigger::OnModified(t) => t,
            Trigger::OnStartup(t) => t,
            Trigger::RemoteSync(t) => t,
            Trigger::Combined(t) => t,
        }
    }
}

impl BackupTrigger for Trigger {
    fn register(&self, ctx: TriggerContext) {
        self.as_dyn().register(ctx)
    }

    fn unregister(&self) {
        self.as_dyn().unregister()
    }

    fn is_active(&self) -> bool {
        self.as_dyn().is_active()
    }

    fn name(&self) -> &'static str {
        self.as_dyn().name()
    }
}

/// Serde description of a trigger, as found in configuration files
///
/// ```json
/// [
///   { "kind": "on_save" },
///   { "kind": "on_modified", "quiet_period": "2s" },
///   { "kind": "interval", "every": "1h" },
///   { "kind": "scheduled_time", "at": "03:30:00", "weekday": "Sun" },
///   { "kind": "on_startup", "delay": "10s" },
///   { "kind": "combined", "triggers": [{ "kind": "on_save" }] }
/// ]
/// ```
///
/// Remote sync triggers need a repository handle and are attached through
/// [`FileManagerBuilder::remote`](crate::FileManagerBuilder::remote) instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerConfig {
    Interval {
        #[serde(with = "humantime_duration")]
        every: Duration,
    },
    ScheduledTime {
        at: NaiveTime,
        #[serde(default)]
        weekday: Option<Weekday>,
    },
    OnSave,
    OnModified {
        #[serde(with = "humantime_duration")]
        quiet_period: Duration,
    },
    OnStartup {
        #[serde(with = "humantime_duration", default = "zero_duration")]
        delay: Duration,
    },
    Combined {
        triggers: Vec<TriggerConfig>,
    },
}

fn zero_duration() -> Duration {
    Duration::ZERO
}

impl TriggerConfig {
    /// Reject configurations that could never fire sensibly
    pub fn validate(&self) -> Result<()> {
        match self {
            TriggerConfig::Interval { every } if every.is_zero() => Err(
                SafekeepError::invalid_config("interval trigger period must be non-zero"),
            ),
            TriggerConfig::OnModified { quiet_period } if quiet_period.is_zero() => Err(
                SafekeepError::invalid_config("on_modified quiet period must be non-zero"),
            ),
            TriggerConfig::Combined { triggers } if triggers.is_empty() => Err(
                SafekeepError::invalid_config("combined trigger needs at least one child"),
            ),
            TriggerConfig::Combined { triggers } => {
                triggers.iter().try_for_each(TriggerConfig::validate)
            }
            _ => Ok(()),
        }
    }

    /// Create the described trigger (inactive)
    pub fn build(&self) -> Trigger {
        match self {
            TriggerConfig::Interval { every } => Trigger::interval(*every),
            TriggerConfig::ScheduledTime { at, weekday } => {
                Trigger::ScheduledTime(ScheduledTimeTrigger::new(*at, *weekday))
            }
            TriggerConfig::OnSave => Trigger::on_save(),
            TriggerConfig::OnModified { quiet_period } => Trigger::on_modified(*quiet_period),
            TriggerConfig::OnStartup { delay } => Trigger::on_startup(*delay),
            TriggerConfig::Combined { triggers } => {
                Trigger::combined(triggers.iter().map(TriggerConfig::build).collect())
            }
        }
    }
}
