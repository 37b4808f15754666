//! Core data types used throughout the safekeep library
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Configuration**: `BackupConfig`, `RollbackOptions`, `RemoteSyncConfig`,
//!   `AutoSaveConfig`, `SafekeepConfig` - operation parameters, all loadable
//!   from JSON
//! - **Backups**: `BackupRecord` - one backup copy on disk
//! - **Remote state**: `RemoteSyncState` - rate limiting bookkeeping
//! - **Reports**: `BulkBackupReport`, `SweepReport`, `SyncReport` - aggregate
//!   results of registry-wide operations
//!
//! Durations are written in configuration files in humantime notation
//! (`"500ms"`, `"5m"`, `"30days"`).
//!
//! ## Examples
//!
//! ```rust
//! use safekeep::types::{BackupConfig, RollbackOptions};
//! use std::time::Duration;
//!
//! let backups = BackupConfig {
//!     max_backup_count: 5,
//!     retention_period: Some(Duration::from_secs(7 * 24 * 3600)),
//!     ..Default::default()
//! };
//! assert!(backups.validate().is_ok());
//!
//! let rollback = RollbackOptions {
//!     max_retries: 2,
//!     ..Default::default()
//! };
//! assert_eq!(rollback.attempt_limit(10), 3);
//! ```

use crate::error::{Result, SafekeepError};
use crate::triggers::TriggerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder replaced by the backup timestamp in a filename pattern
pub const TIMESTAMP_TOKEN: &str = "{timestamp}";

/// Default backup filename pattern
pub const DEFAULT_BACKUP_PATTERN: &str = "{filename}_{timestamp}.bak";

/// Default interval of the registry's auto-save sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Serde helpers writing durations in humantime notation
pub(crate) mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Retention policy and naming of backup copies for one managed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Maximum number of backups kept (oldest are pruned first)
    pub max_backup_count: usize,
    /// Backups older than this are pruned (`None` = keep regardless of age)
    #[serde(with = "humantime_duration::option")]
    pub retention_period: Option<Duration>,
    /// Filename pattern; tokens: `{filename}`, `{stem}`, `{ext}`, `{timestamp}`
    pub filename_pattern: String,
    /// Directory holding backups (`None` = next to the managed file)
    pub backup_dir: Option<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_backup_count: 10,
            retention_period: Some(Duration::from_secs(30 * 24 * 3600)),
            filename_pattern: DEFAULT_BACKUP_PATTERN.to_string(),
            backup_dir: None,
        }
    }
}

impl BackupConfig {
    /// Check that the configuration can produce distinguishable backups
    pub fn validate(&self) -> Result<()> {
        if self.max_backup_count == 0 {
            return Err(SafekeepError::invalid_config(
                "max_backup_count must be at least 1",
            ));
        }
        if self.filename_pattern.matches(TIMESTAMP_TOKEN).count() != 1 {
            return Err(SafekeepError::invalid_config(format!(
                "backup pattern '{}' must contain {} exactly once",
                self.filename_pattern, TIMESTAMP_TOKEN
            )));
        }
        if self.filename_pattern.contains('/') || self.filename_pattern.contains('\\') {
            return Err(SafekeepError::invalid_config(format!(
                "backup pattern '{}' must be a file name, not a path",
                self.filename_pattern
            )));
        }
        Ok(())
    }
}

/// Options controlling the rollback fallback chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackOptions {
    /// Additional backups to try after the newest one (negative = try all)
    pub max_retries: i32,
    /// Pause between attempts
    #[serde(with = "humantime_duration")]
    pub retry_delay: Duration,
    /// Return an error instead of an exhausted outcome when nothing restores
    pub throw_on_all_failed: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            max_retries: -1,
            retry_delay: Duration::ZERO,
            throw_on_all_failed: false,
        }
    }
}

impl RollbackOptions {
    /// Number of backups that will be attempted out of `available`
    pub fn attempt_limit(&self, available: usize) -> usize {
        if self.max_retries < 0 {
            available
        } else {
            available.min(self.max_retries as usize + 1)
        }
    }
}

/// A single backup copy of a managed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Location of the backup file
    pub path: PathBuf,
    /// Modification time of the backup file
    pub created_at: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
}

impl BackupRecord {
    /// File name of the backup
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Location of a tracked file inside a remote repository and polling cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSyncConfig {
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Branch to read from
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Path of the file inside the repository
    pub remote_path: String,
    /// How often the trigger polls
    #[serde(with = "humantime_duration", default = "default_polling_interval")]
    pub polling_interval: Duration,
    /// Minimum time between two remote checks
    #[serde(with = "humantime_duration", default = "default_cache_duration")]
    pub cache_duration: Duration,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_polling_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_cache_duration() -> Duration {
    Duration::from_secs(60)
}

impl RemoteSyncConfig {
    /// Create a config with default branch and cadence
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: default_branch(),
            remote_path: remote_path.into(),
            polling_interval: default_polling_interval(),
            cache_duration: default_cache_duration(),
        }
    }

    /// Check that the remote location is complete
    pub fn validate(&self) -> Result<()> {
        if self.owner.is_empty() || self.repo.is_empty() || self.remote_path.is_empty() {
            return Err(SafekeepError::invalid_config(
                "remote sync needs owner, repo and remote_path",
            ));
        }
        if self.polling_interval.is_zero() {
            return Err(SafekeepError::invalid_config(
                "remote polling interval must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Bookkeeping used to avoid redundant remote calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSyncState {
    /// When the remote was last consulted
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Last remote modification time that has been observed and handled
    pub last_remote_pushed_at: Option<DateTime<Utc>>,
}

/// Auto-save settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSaveConfig {
    /// Whether cached values are flushed by the sweep
    pub enabled: bool,
    /// Interval between two sweeps of the registry
    #[serde(with = "humantime_duration")]
    pub sweep_interval: Duration,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Top-level configuration, typically read from a JSON file
///
/// ```json
/// {
///   "backup": { "max_backup_count": 5, "retention_period": "7days" },
///   "rollback": { "max_retries": 3, "retry_delay": "100ms" },
///   "auto_save": { "enabled": true, "sweep_interval": "500ms" },
///   "triggers": [
///     { "kind": "on_save" },
///     { "kind": "interval", "every": "1h" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafekeepConfig {
    /// Backup retention and naming
    pub backup: BackupConfig,
    /// Rollback behaviour for restores
    pub rollback: RollbackOptions,
    /// Auto-save behaviour
    pub auto_save: AutoSaveConfig,
    /// Backup triggers attached to every managed file built from this config
    pub triggers: Vec<TriggerConfig>,
}

impl SafekeepConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| SafekeepError::from_io(e, path))?;
        let config: SafekeepConfig = serde_json::from_str(&raw)
            .map_err(|e| SafekeepError::invalid_config(format!("{:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.backup.validate()?;
        for trigger in &self.triggers {
            trigger.validate()?;
        }
        Ok(())
    }
}

/// A file whose operation failed inside a bulk operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    /// Managed file path
    pub path: PathBuf,
    /// Human-readable reason
    pub reason: String,
}

/// A backup produced by a bulk operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSuccess {
    /// Managed file path
    pub path: PathBuf,
    /// Backup that was written
    pub backup_path: PathBuf,
}

/// Aggregate result of `backup_all`, `backup_incremental` and `backup_where`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkBackupReport {
    /// Files backed up
    pub succeeded: Vec<BackupSuccess>,
    /// Files whose backup failed
    pub failures: Vec<FileFailure>,
}

impl BulkBackupReport {
    /// Whether every selected file was backed up
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of files the operation selected
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failures.len()
    }
}

/// Result of one auto-save sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// Files flushed to disk
    pub flushed: Vec<PathBuf>,
    /// Files whose flush failed (flag left set)
    pub failures: Vec<FileFailure>,
    /// The sweep did not run because another one was in flight
    pub skipped: bool,
}

/// Result of `sync_all`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Files overwritten with remote content
    pub updated: Vec<PathBuf>,
    /// Files found up to date (or skipped by the rate limit)
    pub unchanged: Vec<PathBuf>,
    /// Files whose check failed
    pub failures: Vec<FileFailure>,
}
