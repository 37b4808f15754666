//! Per-file persistence façade
//!
//! A [`FileManager`] owns everything about one managed file: reading and
//! writing it through a [`Serializer`], the cached in-memory value, the dirty
//! flags, its backups, its triggers and optionally its remote sync.
//!
//! ## Dirty flags
//!
//! Two independent flags track what has not been persisted yet:
//!
//! | Operation | `needs_auto_save` | `needs_backup` |
//! |-----------|-------------------|----------------|
//! | `mark_changed` | set | set |
//! | `save` | cleared | set |
//! | `auto_save` | cleared | unchanged |
//! | `create_backup` | unchanged | cleared |
//!
//! ## Locking
//!
//! All I/O on one file goes through a per-file `tokio::sync::RwLock`: `load`
//! takes the read side, while save, backup, restore and remote installs take
//! the write side. Flags are atomics and can be read at any time without
//! waiting for I/O.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use safekeep::{FileManager, Trigger};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Settings {
//!     theme: String,
//! }
//!
//! # async fn example() -> safekeep::Result<()> {
//! let manager = FileManager::<Settings>::builder("settings.json")
//!     .json()
//!     .trigger(Trigger::on_save())
//!     .build()?;
//! manager.activate_triggers();
//!
//! manager.save(Settings { theme: "dark".into() }).await?;
//! let settings = manager.load().await?;
//! assert_eq!(settings.theme, "dark");
//! # Ok(())
//! # }
//! ```

use crate::backup::BackupStore;
use crate::error::{Result, SafekeepError};
use crate::events::{EventBus, FileEvent};
use crate::registry::ManagedEntry;
use crate::remote::{CheckOutcome, RemoteRepository, RemoteSync};
use crate::rollback::{RollbackDetails, RollbackEngine, RollbackOutcome};
use crate::serializer::{JsonSerializer, Serializer};
use crate::triggers::{BackupCallback, BackupTrigger, RemoteSyncTrigger, Trigger, TriggerContext};
use crate::types::{BackupConfig, BackupRecord, RemoteSyncConfig, RollbackOptions, SafekeepConfig};
use crate::utils;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Listener told about restores that skipped the newest backup or failed
pub type RollbackCallback = Arc<dyn Fn(&RollbackDetails) + Send + Sync>;

struct Inner<T> {
    path: PathBuf,
    serializer: Box<dyn Serializer<T>>,
    needs_auto_save: AtomicBool,
    needs_backup: AtomicBool,
    cache: Mutex<Option<T>>,
    auto_save_enabled: AtomicBool,
    io_lock: Arc<RwLock<()>>,
    backups: BackupStore,
    rollback: RollbackOptions,
    events: EventBus,
    triggers: Vec<Trigger>,
    remote: Option<Arc<RemoteSync>>,
}

/// Dirty flag cleared for the duration of a write
///
/// Dropping it without [`commit`](Self::commit), whether through an error or
/// because the future was dropped, sets the flag again if it was set before.
struct DirtyFlag<'a> {
    flag: &'a AtomicBool,
    was_dirty: bool,
}

impl<'a> DirtyFlag<'a> {
    fn take(flag: &'a AtomicBool) -> Self {
        let was_dirty = flag.swap(false, Ordering::SeqCst);
        Self { flag, was_dirty }
    }

    fn commit(mut self) {
        self.was_dirty = false;
    }
}

impl Drop for DirtyFlag<'_> {
    fn drop(&mut self) {
        if self.was_dirty {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Load/save façade for one managed file
///
/// Cloning is cheap; clones share the same state.
pub struct FileManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FileManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for FileManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileManager")
            .field("path", &self.inner.path)
            .field("needs_auto_save", &self.inner.needs_auto_save.load(Ordering::SeqCst))
            .field("needs_backup", &self.inner.needs_backup.load(Ordering::SeqCst))
            .field("triggers", &self.inner.triggers.len())
            .field("remote", &self.inner.remote.is_some())
            .finish()
    }
}

impl<T> FileManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start building a manager for `path`
    pub fn builder(path: impl Into<PathBuf>) -> FileManagerBuilder<T> {
        FileManagerBuilder::new(path)
    }

    /// Absolute path of the managed file
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether in-memory changes still have to be written
    pub fn needs_auto_save(&self) -> bool {
        self.inner.needs_auto_save.load(Ordering::SeqCst)
    }

    /// Whether changes happened since the last backup
    pub fn needs_backup(&self) -> bool {
        self.inner.needs_backup.load(Ordering::SeqCst)
    }

    /// Whether auto-save may flush the cached value
    pub fn is_auto_save_enabled(&self) -> bool {
        self.inner.auto_save_enabled.load(Ordering::SeqCst)
    }

    /// Turn auto-save on or off
    pub fn set_auto_save_enabled(&self, enabled: bool) {
        self.inner.auto_save_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Last value loaded, saved or marked changed
    pub fn cached(&self) -> Option<T> {
        self.inner.cache.lock().clone()
    }

    /// Bus this manager publishes on
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Backup store of this file
    pub fn backup_store(&self) -> &BackupStore {
        &self.inner.backups
    }

    /// Default options used by [`restore`](Self::restore)
    pub fn rollback_options(&self) -> &RollbackOptions {
        &self.inner.rollback
    }

    /// Remote sync, if configured
    pub fn remote(&self) -> Option<&Arc<RemoteSync>> {
        self.inner.remote.as_ref()
    }

    /// Attached triggers
    pub fn triggers(&self) -> &[Trigger] {
        &self.inner.triggers
    }

    /// Whether the managed file exists on disk
    pub async fn exists(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.inner.path).await?)
    }

    /// Read and decode the file
    pub async fn load(&self) -> Result<T> {
        self.load_cancellable(&CancellationToken::new()).await
    }

    /// Read and decode the file, populating the cache
    ///
    /// Dirty flags are left as they are.
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::NotFound`] if the file does not exist
    /// - [`SafekeepError::Decode`] if the content cannot be decoded
    /// - [`SafekeepError::Cancelled`] if `cancel` fires first
    #[instrument(skip(self, cancel), fields(path = ?self.inner.path))]
    pub async fn load_cancellable(&self, cancel: &CancellationToken) -> Result<T> {
        let _io = self.inner.io_lock.read().await;
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SafekeepError::Cancelled),
            read = utils::read_file(&self.inner.path) => read?,
        };
        let value = self.inner.serializer.decode(&bytes)?;
        *self.inner.cache.lock() = Some(value.clone());
        debug!("Loaded {}", utils::format_bytes(bytes.len() as u64));
        Ok(value)
    }

    /// Encode and atomically write `value`
    pub async fn save(&self, value: T) -> Result<()> {
        self.save_cancellable(value, &CancellationToken::new()).await
    }

    /// Encode and atomically write `value`
    ///
    /// On success the cache holds `value`, `needs_backup` is set,
    /// `needs_auto_save` is cleared and `FileSaved` is published.
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::Encode`] if the value cannot be encoded
    /// - [`SafekeepError::Cancelled`] if `cancel` fires before the rename
    /// - [`SafekeepError::Io`] if writing fails
    #[instrument(skip(self, value, cancel), fields(path = ?self.inner.path))]
    pub async fn save_cancellable(&self, value: T, cancel: &CancellationToken) -> Result<()> {
        let bytes = self.inner.serializer.encode(&value)?;
        {
            let _io = self.inner.io_lock.write().await;
            utils::atomic_write_cancellable(&self.inner.path, &bytes, cancel).await?;
            *self.inner.cache.lock() = Some(value);
            self.inner.needs_auto_save.store(false, Ordering::SeqCst);
            self.inner.needs_backup.store(true, Ordering::SeqCst);
        }
        debug!("Saved {}", utils::format_bytes(bytes.len() as u64));
        self.publish_saved();
        Ok(())
    }

    /// Replace the cached value without touching disk
    ///
    /// Sets both dirty flags; the next auto-save sweep writes the value.
    pub fn mark_changed(&self, value: T) {
        *self.inner.cache.lock() = Some(value);
        self.inner.needs_auto_save.store(true, Ordering::SeqCst);
        self.inner.needs_backup.store(true, Ordering::SeqCst);
    }

    /// Write the cached value
    pub async fn auto_save(&self) -> Result<()> {
        self.auto_save_cancellable(&CancellationToken::new()).await
    }

    /// Write the cached value, clearing only `needs_auto_save`
    ///
    /// A `mark_changed` racing with the write keeps the flag set, so the newer
    /// value is flushed by the next sweep.
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::NotEnabled`] if auto-save is switched off
    /// - [`SafekeepError::NoCachedData`] if nothing is cached
    /// - [`SafekeepError::Io`] if writing fails (the flag stays set)
    #[instrument(skip(self, cancel), fields(path = ?self.inner.path))]
    pub async fn auto_save_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.is_auto_save_enabled() {
            return Err(SafekeepError::NotEnabled(format!(
                "auto-save for {:?}",
                self.inner.path
            )));
        }

        {
            let _io = self.inner.io_lock.write().await;
            // Cleared before the snapshot so a later mark_changed sets it again
            let flag = DirtyFlag::take(&self.inner.needs_auto_save);
            let snapshot = self
                .inner
                .cache
                .lock()
                .clone()
                .ok_or_else(|| SafekeepError::NoCachedData(self.inner.path.clone()))?;
            let bytes = self.inner.serializer.encode(&snapshot)?;
            utils::atomic_write_cancellable(&self.inner.path, &bytes, cancel).await?;
            flag.commit();
        }

        debug!("Auto-saved cached value");
        self.publish_saved();
        Ok(())
    }

    fn publish_saved(&self) {
        self.inner.events.publish(FileEvent::FileSaved {
            path: self.inner.path.clone(),
        });
    }

    /// Copy the current file into a new backup
    pub async fn create_backup(&self) -> Result<PathBuf> {
        self.create_backup_cancellable(&CancellationToken::new()).await
    }

    /// Copy the current file into a new backup, clearing `needs_backup`
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::NotFound`] if the file does not exist yet
    /// - [`SafekeepError::Cancelled`] if `cancel` fires first
    /// - [`SafekeepError::Io`] if copying fails
    #[instrument(skip(self, cancel), fields(path = ?self.inner.path))]
    pub async fn create_backup_cancellable(&self, cancel: &CancellationToken) -> Result<PathBuf> {
        let backup_path = {
            let _io = self.inner.io_lock.write().await;
            let flag = DirtyFlag::take(&self.inner.needs_backup);
            let path = self.inner.backups.create_backup_cancellable(cancel).await?;
            flag.commit();
            path
        };

        self.inner.events.publish(FileEvent::BackupCreated {
            path: self.inner.path.clone(),
            backup_path: backup_path.clone(),
        });
        Ok(backup_path)
    }

    /// Backups of this file, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.inner.backups.list_backups().await
    }

    /// Apply the retention policy now, returning how many backups were deleted
    pub async fn prune_backups(&self) -> Result<usize> {
        self.inner.backups.prune().await
    }

    /// Write recovered bytes back and make them the cached value
    async fn install_recovered(&self, bytes: &[u8], value: T) -> Result<()> {
        utils::atomic_write(&self.inner.path, bytes).await?;
        *self.inner.cache.lock() = Some(value);
        self.inner.needs_auto_save.store(false, Ordering::SeqCst);
        self.inner.needs_backup.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Restore the newest backup over the managed file
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::NotFound`] if there is no backup
    /// - [`SafekeepError::Decode`] if the newest backup is corrupt
    #[instrument(skip(self), fields(path = ?self.inner.path))]
    pub async fn restore_from_latest_backup(&self) -> Result<T> {
        let _io = self.inner.io_lock.write().await;
        let latest = self
            .inner
            .backups
            .latest_backup()
            .await?
            .ok_or_else(|| SafekeepError::NotFound(self.inner.backups.backup_dir()))?;

        let bytes = utils::read_file(&latest.path).await?;
        let value = self.inner.serializer.decode(&bytes)?;
        self.install_recovered(&bytes, value.clone()).await?;
        info!("Restored {:?} from {:?}", self.inner.path, latest.path);
        Ok(value)
    }

    /// Restore with the manager's default rollback options
    pub async fn restore(&self) -> Result<RollbackOutcome<T>> {
        self.restore_with_rollback(self.inner.rollback.clone(), None)
            .await
    }

    /// Restore from the newest backup that decodes
    ///
    /// When an older backup had to be used, or none worked, `callback` is
    /// called and `BackupRollback` is published. A recovered value is written
    /// back to the managed file.
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::FullRollbackFailure`] if nothing restored and
    ///   `options.throw_on_all_failed` is set
    /// - [`SafekeepError::Io`] if the backups cannot be listed or the file
    ///   cannot be rewritten
    #[instrument(skip(self, options, callback), fields(path = ?self.inner.path))]
    pub async fn restore_with_rollback(
        &self,
        options: RollbackOptions,
        callback: Option<RollbackCallback>,
    ) -> Result<RollbackOutcome<T>> {
        let outcome = {
            let _io = self.inner.io_lock.write().await;
            let candidates: Vec<PathBuf> = self
                .inner
                .backups
                .list_backups()
                .await?
                .into_iter()
                .map(|record| record.path)
                .collect();

            let outcome = RollbackEngine::new(options.clone())
                .run(&candidates, &*self.inner.serializer, &CancellationToken::new())
                .await?;
            if let RollbackOutcome::Recovered { value, bytes, .. } = &outcome {
                self.install_recovered(bytes, value.clone()).await?;
            }
            outcome
        };

        if outcome.is_rollback() {
            let details = outcome.details();
            warn!(
                "Rollback for {:?}: {} backup(s) tried, restored from {:?}",
                self.inner.path,
                details.tried_paths.len(),
                details.successful_path
            );
            if let Some(callback) = &callback {
                callback(&details);
            }
            self.inner.events.publish(FileEvent::BackupRollback {
                path: self.inner.path.clone(),
                tried_paths: details.tried_paths,
                successful_path: details.successful_path,
                reasons: details.reasons,
            });
        }

        outcome.escalate(&options)
    }

    /// Remove the managed file and forget the cached value
    ///
    /// Backups are kept.
    #[instrument(skip(self), fields(path = ?self.inner.path))]
    pub async fn delete(&self) -> Result<()> {
        let _io = self.inner.io_lock.write().await;
        tokio::fs::remove_file(&self.inner.path)
            .await
            .map_err(|e| SafekeepError::from_io(e, &self.inner.path))?;
        *self.inner.cache.lock() = None;
        self.inner.needs_auto_save.store(false, Ordering::SeqCst);
        self.inner.needs_backup.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Check the remote once, now
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::NotEnabled`] if no remote is configured
    /// - [`SafekeepError::Network`] if the repository is unreachable
    pub async fn sync_remote(&self) -> Result<CheckOutcome> {
        let remote = self
            .inner
            .remote
            .as_ref()
            .ok_or_else(|| SafekeepError::NotEnabled("remote sync".to_string()))?;
        remote.check_and_sync(&CancellationToken::new()).await
    }

    /// Callback triggers use to back up this file
    ///
    /// Holds the manager weakly so active triggers never keep it alive.
    fn backup_callback(&self) -> BackupCallback {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            let weak = weak.clone();
            async move {
                let inner = weak
                    .upgrade()
                    .ok_or_else(|| SafekeepError::internal("file manager dropped"))?;
                FileManager { inner }.create_backup().await
            }
            .boxed()
        })
    }

    /// Start every attached trigger
    pub fn activate_triggers(&self) {
        if self.inner.triggers.is_empty() {
            return;
        }
        let ctx = TriggerContext::new(
            self.inner.path.clone(),
            self.inner.events.clone(),
            self.backup_callback(),
        );
        for trigger in &self.inner.triggers {
            trigger.register(ctx.clone());
        }
        debug!(
            "Activated {} trigger(s) for {:?}",
            self.inner.triggers.len(),
            self.inner.path
        );
    }

    /// Stop every attached trigger
    pub fn deactivate_triggers(&self) {
        for trigger in &self.inner.triggers {
            trigger.unregister();
        }
    }
}

#[async_trait]
impl<T> ManagedEntry for FileManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn path(&self) -> &Path {
        FileManager::path(self)
    }

    fn needs_auto_save(&self) -> bool {
        FileManager::needs_auto_save(self)
    }

    fn needs_backup(&self) -> bool {
        FileManager::needs_backup(self)
    }

    fn is_auto_save_enabled(&self) -> bool {
        FileManager::is_auto_save_enabled(self)
    }

    fn has_remote(&self) -> bool {
        self.inner.remote.is_some()
    }

    async fn auto_save(&self) -> Result<()> {
        FileManager::auto_save(self).await
    }

    async fn create_backup(&self) -> Result<PathBuf> {
        FileManager::create_backup(self).await
    }

    async fn sync_remote(&self) -> Result<CheckOutcome> {
        FileManager::sync_remote(self).await
    }

    fn activate_triggers(&self) {
        FileManager::activate_triggers(self)
    }

    fn deactivate_triggers(&self) {
        FileManager::deactivate_triggers(self)
    }
}

/// Builder for [`FileManager`]
///
/// # Examples
///
/// ```rust
/// use safekeep::{FileManager, TextSerializer, BackupConfig, Trigger};
/// use std::time::Duration;
///
/// let manager = FileManager::<String>::builder("notes.txt")
///     .serializer(TextSerializer)
///     .backup_config(BackupConfig {
///         max_backup_count: 3,
///         ..Default::default()
///     })
///     .trigger(Trigger::on_modified(Duration::from_secs(2)))
///     .build()
///     .unwrap();
/// assert!(manager.path().is_absolute());
/// ```
pub struct FileManagerBuilder<T> {
    path: PathBuf,
    serializer: Option<Box<dyn Serializer<T>>>,
    backup: BackupConfig,
    rollback: RollbackOptions,
    triggers: Vec<Trigger>,
    auto_save: bool,
    events: Option<EventBus>,
    remote: Option<(Arc<dyn RemoteRepository>, RemoteSyncConfig)>,
}

impl<T> FileManagerBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a builder with default settings and no serializer
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            serializer: None,
            backup: BackupConfig::default(),
            rollback: RollbackOptions::default(),
            triggers: Vec::new(),
            auto_save: true,
            events: None,
            remote: None,
        }
    }

    /// Set the byte format
    pub fn serializer(mut self, serializer: impl Serializer<T> + 'static) -> Self {
        self.serializer = Some(Box::new(serializer));
        self
    }

    /// Use compact JSON
    pub fn json(self) -> Self
    where
        T: Serialize + DeserializeOwned,
    {
        self.serializer(JsonSerializer::<T>::new())
    }

    /// Set backup retention and naming
    pub fn backup_config(mut self, config: BackupConfig) -> Self {
        self.backup = config;
        self
    }

    /// Set the options used by [`FileManager::restore`]
    pub fn rollback_options(mut self, options: RollbackOptions) -> Self {
        self.rollback = options;
        self
    }

    /// Attach a trigger
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Attach several triggers
    pub fn triggers(mut self, triggers: impl IntoIterator<Item = Trigger>) -> Self {
        self.triggers.extend(triggers);
        self
    }

    /// Enable or disable auto-save (enabled by default)
    pub fn auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = enabled;
        self
    }

    /// Publish on a shared bus instead of a private one
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Keep the file in sync with a remote repository
    ///
    /// Adds a polling trigger at `config.polling_interval`.
    pub fn remote(mut self, repository: Arc<dyn RemoteRepository>, config: RemoteSyncConfig) -> Self {
        self.remote = Some((repository, config));
        self
    }

    /// Apply backup, rollback, auto-save and trigger settings from a config file
    pub fn config(mut self, config: &SafekeepConfig) -> Self {
        self.backup = config.backup.clone();
        self.rollback = config.rollback.clone();
        self.auto_save = config.auto_save.enabled;
        self.triggers
            .extend(config.triggers.iter().map(|trigger| trigger.build()));
        self
    }

    /// Build the manager; triggers stay inactive until activated
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::InvalidConfiguration`] if no serializer was set or a
    ///   config section is invalid
    pub fn build(self) -> Result<FileManager<T>> {
        let serializer = self
            .serializer
            .ok_or_else(|| SafekeepError::invalid_config("a serializer is required"))?;
        let path = std::path::absolute(&self.path)?;
        let backups = BackupStore::new(&path, self.backup)?;
        let events = self.events.unwrap_or_default();
        let io_lock = Arc::new(RwLock::new(()));

        let remote = match self.remote {
            Some((repository, config)) => Some(Arc::new(
                RemoteSync::new(&path, config, repository, backups.clone(), events.clone())?
                    .with_io_lock(io_lock.clone()),
            )),
            None => None,
        };

        let mut triggers = self.triggers;
        if let Some(sync) = &remote {
            triggers.push(Trigger::RemoteSync(RemoteSyncTrigger::new(sync.clone())));
        }

        let inner = Arc::new(Inner {
            path,
            serializer,
            needs_auto_save: AtomicBool::new(false),
            needs_backup: AtomicBool::new(false),
            cache: Mutex::new(None),
            auto_save_enabled: AtomicBool::new(self.auto_save),
            io_lock,
            backups,
            rollback: self.rollback,
            events,
            triggers,
            remote,
        });

        if let Some(sync) = &inner.remote {
            let weak = Arc::downgrade(&inner);
            sync.set_overwrite_hook(move || {
                if let Some(inner) = weak.upgrade() {
                    *inner.cache.lock() = None;
                    inner.needs_auto_save.store(false, Ordering::SeqCst);
                }
            });
        }

        debug!("Built file manager for {:?}", inner.path);
        Ok(FileManager { inner })
    }
}
