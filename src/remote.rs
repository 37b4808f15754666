//! Remote synchronization of a managed file
//!
//! [`RemoteSync`] keeps one local file in step with a file stored in a remote
//! Git-hosted repository. The remote always wins: when it diverges, the local
//! file is backed up and then overwritten.
//!
//! ## Change detection
//!
//! Each check escalates from cheap to expensive calls and stops as soon as it
//! can prove nothing changed:
//!
//! ```text
//! rate limit ──> repository timestamp ──> content hash ──> download
//!  (no call)        (1 small call)        (1 small call)   (full content)
//! ```
//!
//! 1. Within `cache_duration` of the previous check, nothing is done.
//! 2. If the repository's last modification did not move past the last one
//!    handled, the file is unchanged.
//! 3. If the remote SHA-256 equals the local file's, the file is unchanged.
//! 4. Otherwise the local file is backed up (best effort), the content is
//!    downloaded, and JSON files are diffed against the local copy.
//! 5. The local file is atomically replaced and the owner is told to drop its
//!    cached value.
//! 6. Timestamps are recorded and `RemoteUpdated` is published.
//!
//! The repository itself is abstracted by [`RemoteRepository`]; an in-process
//! [`InMemoryRemoteRepository`] is provided for hosts and tests.

use crate::backup::BackupStore;
use crate::error::{Result, SafekeepError};
use crate::events::{EventBus, FileEvent};
use crate::json_diff::{self, JsonDiffReport};
use crate::types::{RemoteSyncConfig, RemoteSyncState};
use crate::utils;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Read access to files in a remote repository
///
/// Authentication and transport are up to the implementation.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// When the repository last received a change
    async fn last_modified_at(&self, owner: &str, repo: &str) -> Result<DateTime<Utc>>;

    /// Hex SHA-256 of the raw bytes of a file
    async fn content_hash(&self, owner: &str, repo: &str, branch: &str, path: &str)
        -> Result<String>;

    /// Raw bytes of a file
    async fn content(&self, owner: &str, repo: &str, branch: &str, path: &str) -> Result<Vec<u8>>;
}

/// Result of one [`RemoteSync::check_and_sync`] call
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Checked too recently, no remote call made
    Skipped,
    /// Remote matches local
    NoChanges,
    /// Local file replaced with remote content
    Updated {
        /// Safety backup of the previous local content
        backup_path: Option<PathBuf>,
        /// Structural diff for JSON files
        diff: Option<JsonDiffReport>,
    },
}

impl CheckOutcome {
    /// Whether the local file was overwritten
    pub fn is_updated(&self) -> bool {
        matches!(self, CheckOutcome::Updated { .. })
    }
}

type OverwriteHook = Box<dyn Fn() + Send + Sync>;

/// Remote-wins synchronization for one managed file
pub struct RemoteSync {
    path: PathBuf,
    config: RemoteSyncConfig,
    repository: Arc<dyn RemoteRepository>,
    backups: BackupStore,
    events: EventBus,
    state: Mutex<RemoteSyncState>,
    io_lock: Arc<tokio::sync::RwLock<()>>,
    check_lock: tokio::sync::Mutex<()>,
    on_overwrite: RwLock<Option<OverwriteHook>>,
}

impl std::fmt::Debug for RemoteSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSync")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl RemoteSync {
    /// Create a sync for `path`
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::InvalidConfiguration`] if the remote location is incomplete
    pub fn new(
        path: impl Into<PathBuf>,
        config: RemoteSyncConfig,
        repository: Arc<dyn RemoteRepository>,
        backups: BackupStore,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            path: path.into(),
            config,
            repository,
            backups,
            events,
            state: Mutex::new(RemoteSyncState::default()),
            io_lock: Arc::new(tokio::sync::RwLock::new(())),
            check_lock: tokio::sync::Mutex::new(()),
            on_overwrite: RwLock::new(None),
        })
    }

    /// Share the file lock of the owning manager
    pub(crate) fn with_io_lock(mut self, io_lock: Arc<tokio::sync::RwLock<()>>) -> Self {
        self.io_lock = io_lock;
        self
    }

    /// Install the hook run after the local file was overwritten
    pub(crate) fn set_overwrite_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_overwrite.write() = Some(Box::new(hook));
    }

    /// Local file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remote location and cadence
    pub fn config(&self) -> &RemoteSyncConfig {
        &self.config
    }

    /// Snapshot of the rate limiting state
    pub fn state(&self) -> RemoteSyncState {
        self.state.lock().clone()
    }

    fn within_cache_window(&self, now: DateTime<Utc>) -> bool {
        match self.state.lock().last_checked_at {
            Some(last) => now
                .signed_duration_since(last)
                .to_std()
                .map(|elapsed| elapsed < self.config.cache_duration)
                .unwrap_or(false),
            None => false,
        }
    }

    fn record_check(&self, now: DateTime<Utc>, pushed_at: Option<DateTime<Utc>>) {
        let mut state = self.state.lock();
        state.last_checked_at = Some(now);
        if pushed_at.is_some() {
            state.last_remote_pushed_at = pushed_at;
        }
    }

    fn publish_checked(&self, has_changes: bool) {
        self.events.publish(FileEvent::RemoteChecked {
            path: self.path.clone(),
            has_changes,
        });
    }

    /// Run one check against the remote, installing new content if it diverged
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::Network`] if the repository could not be reached
    /// - [`SafekeepError::Cancelled`] if `cancel` fires before the overwrite
    /// - [`SafekeepError::Io`] if the local file could not be read or replaced
    #[instrument(skip(self, cancel), fields(path = ?self.path))]
    pub async fn check_and_sync(&self, cancel: &CancellationToken) -> Result<CheckOutcome> {
        let _check = self.check_lock.lock().await;
        let cfg = &self.config;

        let now = Utc::now();
        if self.within_cache_window(now) {
            debug!("Remote checked recently, skipping");
            return Ok(CheckOutcome::Skipped);
        }

        let pushed_at = self.repository.last_modified_at(&cfg.owner, &cfg.repo).await?;
        let last_handled = self.state.lock().last_remote_pushed_at;
        if last_handled.is_some_and(|handled| pushed_at <= handled) {
            debug!("Repository unchanged since {}", pushed_at);
            self.record_check(now, None);
            self.publish_checked(false);
            return Ok(CheckOutcome::NoChanges);
        }

        if cancel.is_cancelled() {
            return Err(SafekeepError::Cancelled);
        }
        let remote_hash = self
            .repository
            .content_hash(&cfg.owner, &cfg.repo, &cfg.branch, &cfg.remote_path)
            .await?;

        let _io = self.io_lock.write().await;

        let local_exists = tokio::fs::try_exists(&self.path).await?;
        if local_exists {
            let local_hash = utils::hash_file_content_async(&self.path).await?;
            if utils::hashes_match(&local_hash, &remote_hash) {
                debug!("Content hash matches remote");
                self.record_check(now, Some(pushed_at));
                self.publish_checked(false);
                return Ok(CheckOutcome::NoChanges);
            }
        }

        let backup_path = if local_exists {
            match self.backups.create_backup_cancellable(cancel).await {
                Ok(backup) => {
                    self.events.publish(FileEvent::BackupCreated {
                        path: self.path.clone(),
                        backup_path: backup.clone(),
                    });
                    Some(backup)
                }
                Err(SafekeepError::Cancelled) => return Err(SafekeepError::Cancelled),
                Err(e) => {
                    warn!("Safety backup before remote overwrite failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let content = self
            .repository
            .content(&cfg.owner, &cfg.repo, &cfg.branch, &cfg.remote_path)
            .await?;

        let diff = if utils::is_json_path(&self.path) {
            self.diff_against_local(local_exists, &content).await
        } else {
            None
        };

        utils::atomic_write_cancellable(&self.path, &content, cancel).await?;
        if let Some(hook) = self.on_overwrite.read().as_ref() {
            hook();
        }
        self.record_check(now, Some(pushed_at));

        info!(
            "Replaced {:?} with remote content ({})",
            self.path,
            diff.as_ref()
                .map(JsonDiffReport::summary)
                .unwrap_or_else(|| utils::format_bytes(content.len() as u64))
        );
        self.publish_checked(true);
        self.events.publish(FileEvent::RemoteUpdated {
            path: self.path.clone(),
            backup_path: backup_path.clone(),
            diff_report: diff.clone(),
        });

        Ok(CheckOutcome::Updated { backup_path, diff })
    }

    async fn diff_against_local(&self, local_exists: bool, remote: &[u8]) -> Option<JsonDiffReport> {
        let old = if local_exists {
            match tokio::fs::read(&self.path).await {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    warn!("Could not read {:?} for diffing: {}", self.path, e);
                    None
                }
            }
        } else {
            None
        };
        let new = String::from_utf8_lossy(remote);
        match json_diff::diff(old.as_deref(), &new) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Could not diff {:?} against remote: {}", self.path, e);
                None
            }
        }
    }
}

/// Key of a file inside [`InMemoryRemoteRepository`]
type FileKey = (String, String, String, String);

/// Thread-safe in-process [`RemoteRepository`]
///
/// Counts calls per operation so callers can verify how much traffic a sync
/// would have generated.
#[derive(Debug, Default)]
pub struct InMemoryRemoteRepository {
    files: RwLock<HashMap<FileKey, Vec<u8>>>,
    modified: RwLock<HashMap<(String, String), DateTime<Utc>>>,
    offline: AtomicBool,
    timestamp_calls: AtomicUsize,
    hash_calls: AtomicUsize,
    content_calls: AtomicUsize,
}

impl InMemoryRemoteRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a file and advance the repository's modification time
    pub fn put_file(&self, owner: &str, repo: &str, branch: &str, path: &str, content: impl Into<Vec<u8>>) {
        self.files.write().insert(
            (owner.into(), repo.into(), branch.into(), path.into()),
            content.into(),
        );
        let mut modified = self.modified.write();
        let key = (owner.to_string(), repo.to_string());
        let now = Utc::now();
        let next = match modified.get(&key) {
            Some(previous) if *previous >= now => *previous + chrono::Duration::milliseconds(1),
            _ => now,
        };
        modified.insert(key, next);
    }

    /// Override the repository's modification time
    pub fn set_last_modified(&self, owner: &str, repo: &str, at: DateTime<Utc>) {
        self.modified
            .write()
            .insert((owner.to_string(), repo.to_string()), at);
    }

    /// Make every call fail with a network error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `last_modified_at` calls
    pub fn timestamp_calls(&self) -> usize {
        self.timestamp_calls.load(Ordering::SeqCst)
    }

    /// Number of `content_hash` calls
    pub fn hash_calls(&self) -> usize {
        self.hash_calls.load(Ordering::SeqCst)
    }

    /// Number of full downloads
    pub fn content_calls(&self) -> usize {
        self.content_calls.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SafekeepError::network("repository unreachable"))
        } else {
            Ok(())
        }
    }

    fn file(&self, owner: &str, repo: &str, branch: &str, path: &str) -> Result<Vec<u8>> {
        self.files
            .read()
            .get(&(owner.into(), repo.into(), branch.into(), path.into()))
            .cloned()
            .ok_or_else(|| {
                SafekeepError::network(format!("404: {} not found in {}/{}@{}", path, owner, repo, branch))
            })
    }
}

#[async_trait]
impl RemoteRepository for InMemoryRemoteRepository {
    async fn last_modified_at(&self, owner: &str, repo: &str) -> Result<DateTime<Utc>> {
        self.timestamp_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        self.modified
            .read()
            .get(&(owner.to_string(), repo.to_string()))
            .copied()
            .ok_or_else(|| SafekeepError::network(format!("404: repository {}/{} not found", owner, repo)))
    }

    async fn content_hash(&self, owner: &str, repo: &str, branch: &str, path: &str) -> Result<String> {
        self.hash_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        Ok(utils::hash_data(&self.file(owner, repo, branch, path)?))
    }

    async fn content(&self, owner: &str, repo: &str, branch: &str, path: &str) -> Result<Vec<u8>> {
        self.content_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        self.file(owner, repo, branch, path)
    }
}
