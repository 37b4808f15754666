//! Directory of active file managers
//!
//! The [`ManagerRegistry`] knows every managed file of a process. It drives
//! the periodic auto-save sweep and the bulk backup operations, fanning work
//! out per file and isolating failures so one broken file never blocks the
//! rest.
//!
//! Managers of different value types live side by side behind the
//! [`ManagedEntry`] trait.
//!
//! ```rust,no_run
//! use safekeep::{FileManager, ManagerRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> safekeep::Result<()> {
//! let registry = Arc::new(ManagerRegistry::new());
//! let notes = FileManager::<String>::builder("notes.txt")
//!     .serializer(safekeep::TextSerializer)
//!     .events(registry.events().clone())
//!     .build()?;
//!
//! registry.register(notes.clone());
//! registry.start_auto_save(Duration::from_millis(500));
//!
//! notes.mark_changed("draft".to_string());
//! // flushed by the next sweep
//!
//! let report = registry.backup_all().await;
//! assert!(report.is_success());
//! registry.shutdown();
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::events::{EventBus, FileEvent};
use crate::remote::CheckOutcome;
use crate::types::{BackupSuccess, BulkBackupReport, FileFailure, SweepReport, SyncReport};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace};

/// Type-erased view of a [`FileManager`](crate::FileManager)
#[async_trait]
pub trait ManagedEntry: Send + Sync {
    /// Absolute path of the managed file
    fn path(&self) -> &Path;

    /// Whether in-memory changes still have to be written
    fn needs_auto_save(&self) -> bool;

    /// Whether changes happened since the last backup
    fn needs_backup(&self) -> bool;

    /// Whether auto-save may flush the cached value
    fn is_auto_save_enabled(&self) -> bool;

    /// Whether remote sync is configured
    fn has_remote(&self) -> bool;

    /// Flush the cached value
    async fn auto_save(&self) -> Result<()>;

    /// Back up the current file
    async fn create_backup(&self) -> Result<PathBuf>;

    /// Check the remote once
    async fn sync_remote(&self) -> Result<CheckOutcome>;

    /// Start the attached triggers
    fn activate_triggers(&self);

    /// Stop the attached triggers
    fn deactivate_triggers(&self);
}

/// Clears the sweep guard when a sweep ends, including on panic or abort
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// All active managers of a process, keyed by absolute path
pub struct ManagerRegistry {
    managers: DashMap<PathBuf, Arc<dyn ManagedEntry>>,
    events: EventBus,
    sweeping: AtomicBool,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerRegistry")
            .field("managers", &self.managers.len())
            .field("sweeping", &self.sweeping.load(Ordering::SeqCst))
            .field("auto_save_running", &self.is_auto_save_running())
            .finish()
    }
}

impl Default for ManagerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerRegistry {
    /// Create an empty registry with its own event bus
    pub fn new() -> Self {
        Self::with_events(EventBus::new())
    }

    /// Create an empty registry publishing on `events`
    pub fn with_events(events: EventBus) -> Self {
        Self {
            managers: DashMap::new(),
            events,
            sweeping: AtomicBool::new(false),
            sweep_task: Mutex::new(None),
        }
    }

    /// Bus registry-wide events are published on
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Add a manager and activate its triggers
    ///
    /// A manager already registered for the same path is replaced and its
    /// triggers are deactivated.
    pub fn register<M>(&self, manager: M)
    where
        M: ManagedEntry + 'static,
    {
        let entry: Arc<dyn ManagedEntry> = Arc::new(manager);
        let path = entry.path().to_path_buf();
        let previous = self.managers.insert(path.clone(), entry.clone());
        // The previous entry may share triggers with the new one
        if let Some(previous) = &previous {
            previous.deactivate_triggers();
        }
        entry.activate_triggers();
        if previous.is_some() {
            debug!("Replaced manager for {:?}", path);
        } else {
            debug!("Registered manager for {:?}", path);
        }
    }

    /// Remove a manager and deactivate its triggers
    ///
    /// Returns whether a manager was registered for `path`.
    pub fn unregister(&self, path: &Path) -> bool {
        match self.managers.remove(path) {
            Some((_, entry)) => {
                entry.deactivate_triggers();
                debug!("Unregistered manager for {:?}", path);
                true
            }
            None => false,
        }
    }

    /// Manager registered for `path`
    pub fn get(&self, path: &Path) -> Option<Arc<dyn ManagedEntry>> {
        self.managers.get(path).map(|entry| entry.value().clone())
    }

    /// Whether a manager is registered for `path`
    pub fn contains(&self, path: &Path) -> bool {
        self.managers.contains_key(path)
    }

    /// Paths of all registered managers
    pub fn paths(&self) -> Vec<PathBuf> {
        self.managers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered managers
    pub fn len(&self) -> usize {
        self.managers.len()
    }

    /// Whether no manager is registered
    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Snapshot of the managers matching `predicate`
    fn select(&self, predicate: impl Fn(&dyn ManagedEntry) -> bool) -> Vec<Arc<dyn ManagedEntry>> {
        self.managers
            .iter()
            .filter(|entry| predicate(entry.value().as_ref()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Flush every manager with pending in-memory changes
    ///
    /// Returns immediately with `skipped` set if another sweep is in flight.
    pub async fn run_auto_save_sweep(&self) -> SweepReport {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            trace!("Auto-save sweep already running, skipping tick");
            return SweepReport {
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = SweepGuard(&self.sweeping);

        let pending = self.select(|m| m.needs_auto_save() && m.is_auto_save_enabled());
        if pending.is_empty() {
            return SweepReport::default();
        }

        debug!("Auto-saving {} file(s)", pending.len());
        self.events.publish(FileEvent::AutoSaveStarted {
            count: pending.len(),
        });

        let results = join_all(pending.iter().map(|manager| async move {
            (manager.path().to_path_buf(), manager.auto_save().await)
        }))
        .await;

        let mut report = SweepReport::default();
        for (path, result) in results {
            match result {
                Ok(()) => {
                    self.events
                        .publish(FileEvent::AutoSaveCompleted { path: path.clone() });
                    report.flushed.push(path);
                }
                Err(e) => {
                    error!("Auto-save of {:?} failed: {}", path, e);
                    let reason = e.to_string();
                    self.events.publish(FileEvent::AutoSaveFailed {
                        path: path.clone(),
                        reason: reason.clone(),
                    });
                    report.failures.push(FileFailure { path, reason });
                }
            }
        }
        report
    }

    /// Run the auto-save sweep every `interval` until stopped
    ///
    /// Restarts the sweep if it was already running. The task holds the
    /// registry weakly and ends once the registry is dropped.
    pub fn start_auto_save(self: &Arc<Self>, interval: Duration) {
        let interval = interval.max(Duration::from_millis(1));
        let registry: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.run_auto_save_sweep().await;
            }
        });

        if let Some(previous) = self.sweep_task.lock().replace(handle) {
            previous.abort();
        }
        info!("Auto-save sweep started (every {:?})", interval);
    }

    /// Stop the periodic sweep
    pub fn stop_auto_save(&self) {
        if let Some(handle) = self.sweep_task.lock().take() {
            handle.abort();
            info!("Auto-save sweep stopped");
        }
    }

    /// Whether the periodic sweep is running
    pub fn is_auto_save_running(&self) -> bool {
        self.sweep_task.lock().is_some()
    }

    /// Back up every registered file
    pub async fn backup_all(&self) -> BulkBackupReport {
        self.backup_selected(self.select(|_| true)).await
    }

    /// Back up the files changed since their last backup
    pub async fn backup_incremental(&self) -> BulkBackupReport {
        self.backup_selected(self.select(|m| m.needs_backup())).await
    }

    /// Back up the files matching `predicate`
    pub async fn backup_where<F>(&self, predicate: F) -> BulkBackupReport
    where
        F: Fn(&dyn ManagedEntry) -> bool,
    {
        self.backup_selected(self.select(predicate)).await
    }

    async fn backup_selected(&self, selected: Vec<Arc<dyn ManagedEntry>>) -> BulkBackupReport {
        let results = join_all(selected.iter().map(|manager| async move {
            (manager.path().to_path_buf(), manager.create_backup().await)
        }))
        .await;

        let mut report = BulkBackupReport::default();
        for (path, result) in results {
            match result {
                Ok(backup_path) => report.succeeded.push(BackupSuccess { path, backup_path }),
                Err(e) => {
                    error!("Backup of {:?} failed: {}", path, e);
                    report.failures.push(FileFailure {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Bulk backup finished: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failures.len()
        );
        self.events.publish(FileEvent::GlobalBackupCompleted {
            count: report.succeeded.len(),
        });
        report
    }

    /// Check the remote of every manager that has one
    pub async fn sync_all(&self) -> SyncReport {
        let selected = self.select(|m| m.has_remote());
        let results = join_all(selected.iter().map(|manager| async move {
            (manager.path().to_path_buf(), manager.sync_remote().await)
        }))
        .await;

        let mut report = SyncReport::default();
        for (path, result) in results {
            match result {
                Ok(outcome) if outcome.is_updated() => report.updated.push(path),
                Ok(_) => report.unchanged.push(path),
                Err(e) => {
                    error!("Remote sync of {:?} failed: {}", path, e);
                    report.failures.push(FileFailure {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Stop the sweep, deactivate every trigger and forget all managers
    pub fn shutdown(&self) {
        self.stop_auto_save();
        let count = self.managers.len();
        for entry in self.managers.iter() {
            entry.value().deactivate_triggers();
        }
        self.managers.clear();
        info!("Registry shut down ({} manager(s) released)", count);
    }
}

impl Drop for ManagerRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_task.get_mut().take() {
            handle.abort();
        }
    }
}
