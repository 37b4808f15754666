//! Event bus for file lifecycle notifications
//!
//! Managed files, triggers, remote sync and the registry publish
//! [`FileEvent`]s here. The on-save and debounced triggers subscribe to the
//! same bus and filter by path, so `save` never calls a trigger directly.
//!
//! The bus wraps a tokio broadcast channel: publishing never blocks, and a
//! subscriber that falls behind by more than the channel capacity loses the
//! oldest events (it sees a `Lagged` error and continues).
//!
//! # Example
//!
//! ```rust
//! use safekeep::events::{EventBus, FileEvent};
//! use std::path::PathBuf;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut subscriber = bus.subscribe();
//!
//! bus.publish(FileEvent::FileSaved { path: PathBuf::from("/data/settings.json") });
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.path(), Some(PathBuf::from("/data/settings.json").as_path()));
//! # });
//! ```

use crate::json_diff::JsonDiffReport;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Channel capacity for broadcast events
const CHANNEL_CAPACITY: usize = 1024;

/// Notifications published by managed files and the registry
#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    /// A managed file was written (by `save` or auto-save)
    FileSaved {
        /// Managed file path
        path: PathBuf,
    },
    /// A backup copy was created
    BackupCreated {
        /// Managed file path
        path: PathBuf,
        /// New backup
        backup_path: PathBuf,
    },
    /// A restore had to skip the newest backup, or nothing could be restored
    BackupRollback {
        /// Managed file path
        path: PathBuf,
        /// Backups attempted, newest first
        tried_paths: Vec<PathBuf>,
        /// Backup that restored, if any
        successful_path: Option<PathBuf>,
        /// Failure reason per failed attempt
        reasons: Vec<String>,
    },
    /// The remote was consulted
    RemoteChecked {
        /// Managed file path
        path: PathBuf,
        /// Whether the remote differed from the local file
        has_changes: bool,
    },
    /// The local file was replaced with remote content
    RemoteUpdated {
        /// Managed file path
        path: PathBuf,
        /// Safety backup taken before overwriting, if it succeeded
        backup_path: Option<PathBuf>,
        /// Structural diff for JSON files
        diff_report: Option<JsonDiffReport>,
    },
    /// An auto-save sweep found files to flush
    AutoSaveStarted {
        /// Number of files with pending changes
        count: usize,
    },
    /// A file was flushed by the auto-save sweep
    AutoSaveCompleted {
        /// Managed file path
        path: PathBuf,
    },
    /// Flushing a file during the auto-save sweep failed
    AutoSaveFailed {
        /// Managed file path
        path: PathBuf,
        /// Human-readable reason
        reason: String,
    },
    /// A registry-wide backup finished
    GlobalBackupCompleted {
        /// Number of backups written
        count: usize,
    },
}

impl FileEvent {
    /// Managed file the event concerns, if it concerns a single file
    pub fn path(&self) -> Option<&Path> {
        match self {
            FileEvent::FileSaved { path }
            | FileEvent::BackupCreated { path, .. }
            | FileEvent::BackupRollback { path, .. }
            | FileEvent::RemoteChecked { path, .. }
            | FileEvent::RemoteUpdated { path, .. }
            | FileEvent::AutoSaveCompleted { path }
            | FileEvent::AutoSaveFailed { path, .. } => Some(path),
            FileEvent::AutoSaveStarted { .. } | FileEvent::GlobalBackupCompleted { .. } => None,
        }
    }

    /// Whether this is a save notification for `path`
    pub fn is_save_of(&self, path: &Path) -> bool {
        matches!(self, FileEvent::FileSaved { path: saved } if saved == path)
    }
}

/// Publish/subscribe bus shared by every component of one process
///
/// Cloning is cheap; clones share the same channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<FileEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity (1024 events)
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a new event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: FileEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
