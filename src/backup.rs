//! Backup copies of a single managed file
//!
//! [`BackupStore`] writes timestamped copies of one file and enforces the
//! retention policy of its [`BackupConfig`] every time a new copy is made.
//!
//! ## Layout
//!
//! Backups are plain files named by the configured pattern, either next to the
//! managed file or in a dedicated directory:
//!
//! ```text
//! data/
//! ├── settings.json
//! ├── settings.json_20260101_120000_000.bak
//! └── settings.json_20260101_130000_000.bak
//! ```
//!
//! There is no manifest: the set of backups is whatever directory listing
//! matches the pattern. Listings are ordered newest first by modification
//! time, with the file name (whose timestamp token is fixed width) breaking
//! ties when the filesystem's timestamp resolution is too coarse.
//!
//! ## Retention
//!
//! After each new backup, the store deletes the oldest copies beyond
//! `max_backup_count`, then any remaining copies older than
//! `retention_period`. Pruning is best effort: a copy that cannot be deleted is
//! logged and left for the next pass, and never fails the backup itself.

use crate::error::{Result, SafekeepError};
use crate::types::{BackupConfig, BackupRecord, TIMESTAMP_TOKEN};
use crate::utils;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Timestamp format of the `{timestamp}` token (fixed width, sorts chronologically)
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

/// Creates, lists and prunes backups of one file
#[derive(Debug, Clone)]
pub struct BackupStore {
    /// File being backed up
    target: PathBuf,
    /// Retention and naming policy
    config: BackupConfig,
    /// Part of a backup name before the timestamp
    prefix: String,
    /// Part of a backup name after the timestamp
    suffix: String,
}

impl BackupStore {
    /// Create a store for `target`
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::InvalidConfiguration`] if the pattern or limits are unusable
    pub fn new(target: impl Into<PathBuf>, config: BackupConfig) -> Result<Self> {
        config.validate()?;
        let target = target.into();
        if target.file_name().is_none() {
            return Err(SafekeepError::invalid_config(format!(
                "{:?} has no file name to back up",
                target
            )));
        }

        let rendered = render_pattern(&config.filename_pattern, &target);
        let (prefix, suffix) = rendered
            .split_once(TIMESTAMP_TOKEN)
            .map(|(p, s)| (p.to_string(), s.to_string()))
            .ok_or_else(|| SafekeepError::internal("validated pattern lost its timestamp"))?;

        Ok(Self {
            target,
            config,
            prefix,
            suffix,
        })
    }

    /// File being backed up
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Retention and naming policy
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Directory the backups live in
    pub fn backup_dir(&self) -> PathBuf {
        match &self.config.backup_dir {
            Some(dir) => dir.clone(),
            None => self
                .target
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Whether a file name belongs to this store
    pub fn is_backup_name(&self, name: &str) -> bool {
        name.len() > self.prefix.len() + self.suffix.len()
            && name.starts_with(&self.prefix)
            && name.ends_with(&self.suffix)
    }

    /// Backup name for a given instant
    fn backup_name(&self, at: DateTime<Utc>) -> String {
        format!("{}{}{}", self.prefix, at.format(TIMESTAMP_FORMAT), self.suffix)
    }

    /// Pick a backup path that does not exist yet
    ///
    /// On a collision the timestamp moves forward one millisecond, which keeps
    /// names fixed width and in creation order.
    async fn next_backup_path(&self, dir: &Path) -> Result<PathBuf> {
        let mut at = Utc::now();
        loop {
            let candidate = dir.join(self.backup_name(at));
            if !tokio::fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
            at += chrono::Duration::milliseconds(1);
        }
    }

    /// Copy the current file into a new backup and prune old ones
    pub async fn create_backup(&self) -> Result<PathBuf> {
        self.create_backup_cancellable(&CancellationToken::new()).await
    }

    /// Copy the current file into a new backup and prune old ones
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::NotFound`] if the managed file does not exist
    /// - [`SafekeepError::Cancelled`] if `cancel` fires before the copy lands
    /// - [`SafekeepError::Io`] if reading or writing fails
    pub async fn create_backup_cancellable(&self, cancel: &CancellationToken) -> Result<PathBuf> {
        let content = utils::read_file(&self.target).await?;

        let dir = self.backup_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let backup_path = self.next_backup_path(&dir).await?;

        utils::atomic_write_cancellable(&backup_path, &content, cancel).await?;
        info!(
            "Created backup {:?} of {:?} ({})",
            backup_path,
            self.target,
            utils::format_bytes(content.len() as u64)
        );

        match self.prune().await {
            Ok(0) => {}
            Ok(deleted) => debug!("Pruned {} old backup(s) of {:?}", deleted, self.target),
            Err(e) => warn!("Pruning backups of {:?} failed: {}", self.target, e),
        }

        Ok(backup_path)
    }

    /// All backups, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let dir = self.backup_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !self.is_backup_name(&name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    // Deleted between listing and stat
                    trace!("Skipping {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            records.push(BackupRecord {
                path: entry.path(),
                created_at: DateTime::<Utc>::from(modified),
                size: metadata.len(),
            });
        }

        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.file_name().cmp(&a.file_name()))
        });
        Ok(records)
    }

    /// Newest backup, if any
    pub async fn latest_backup(&self) -> Result<Option<BackupRecord>> {
        Ok(self.list_backups().await?.into_iter().next())
    }

    /// Apply the retention policy, returning how many backups were deleted
    pub async fn prune(&self) -> Result<usize> {
        let backups = self.list_backups().await?;
        let now = Utc::now();
        let mut deleted = 0;

        for (index, record) in backups.iter().enumerate() {
            let over_count = index >= self.config.max_backup_count;
            let expired = self.config.retention_period.is_some_and(|retention| {
                now.signed_duration_since(record.created_at)
                    .to_std()
                    .map(|age| age > retention)
                    .unwrap_or(false)
            });
            if !over_count && !expired {
                continue;
            }

            match tokio::fs::remove_file(&record.path).await {
                Ok(()) => {
                    trace!(
                        "Deleted backup {:?} ({})",
                        record.path,
                        if over_count { "over count" } else { "expired" }
                    );
                    deleted += 1;
                }
                Err(e) => warn!("Could not delete backup {:?}: {}", record.path, e),
            }
        }

        Ok(deleted)
    }

    /// Delete every backup of this file
    pub async fn delete_all(&self) -> Result<usize> {
        let mut deleted = 0;
        for record in self.list_backups().await? {
            tokio::fs::remove_file(&record.path).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// Substitute the file-derived tokens of a pattern
fn render_pattern(pattern: &str, target: &Path) -> String {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = target
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = target
        .extension()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    pattern
        .replace("{filename}", &file_name)
        .replace("{stem}", &stem)
        .replace("{ext}", &ext)
}
