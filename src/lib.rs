//! # Safekeep - Data files that do not get lost
//!
//! A library for persisting application data files with automatic protection
//! against data loss.
//!
//! ## Overview
//!
//! Safekeep manages individual data files (settings, documents, caches) and
//! gives each of them:
//! - Atomic saves (write to a temporary file, then rename)
//! - Batched auto-save of in-memory edits
//! - Timestamped backups with count and age based retention
//! - Pluggable backup triggers (interval, time of day, on save, debounced,
//!   on startup)
//! - Rollback to older backups when the newest one is corrupt
//! - Optional remote-wins synchronization with a Git-hosted repository,
//!   including a structural diff for JSON files
//!
//! ## Architecture
//!
//! - **FileManager**: per-file façade owning load/save, the cached value and two
//!   independent dirty flags (`needs_auto_save`, `needs_backup`)
//! - **BackupStore**: creates, lists and prunes backup copies of one file
//! - **RollbackEngine**: walks backups newest first until one decodes
//! - **Triggers**: tokio tasks deciding when a backup runs
//! - **RemoteSync**: timestamp, then hash, then download change detection
//! - **ManagerRegistry**: every active manager; drives the auto-save sweep and
//!   bulk backups
//! - **EventBus**: broadcast channel carrying [`FileEvent`]s between all of
//!   the above
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use safekeep::{FileManager, ManagerRegistry, Trigger, BackupConfig};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Settings {
//!     volume: u32,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> safekeep::Result<()> {
//! let registry = Arc::new(ManagerRegistry::new());
//!
//! let settings = FileManager::<Settings>::builder("./settings.json")
//!     .json()
//!     .backup_config(BackupConfig {
//!         max_backup_count: 5,
//!         ..Default::default()
//!     })
//!     .trigger(Trigger::on_save())
//!     .events(registry.events().clone())
//!     .build()?;
//!
//! registry.register(settings.clone());
//! registry.start_auto_save(Duration::from_millis(500));
//!
//! // Written and backed up right away
//! settings.save(Settings { volume: 7 }).await?;
//!
//! // Written by the next auto-save sweep
//! settings.mark_changed(Settings { volume: 8 });
//!
//! // Recover from the newest readable backup
//! let outcome = settings.restore().await?;
//! println!("restored: {}", outcome.is_recovered());
//!
//! registry.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Files
//!
//! Every setting can come from a JSON file through [`SafekeepConfig`]:
//!
//! ```rust,no_run
//! use safekeep::{FileManager, SafekeepConfig};
//! use std::path::Path;
//!
//! # fn main() -> safekeep::Result<()> {
//! let config = SafekeepConfig::from_file(Path::new("safekeep.json"))?;
//! let notes = FileManager::<String>::builder("notes.txt")
//!     .serializer(safekeep::TextSerializer)
//!     .config(&config)
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, SafekeepError>`. Per-file failures never
//! panic, and the registry's bulk operations report them per file instead of
//! aborting. Triggers log failed backups and keep running.
//!
//! ## Logging
//!
//! The library logs through `tracing` and never installs a subscriber; hosts
//! choose how (and whether) to collect the output.
//!
//! ## Module Organization
//!
//! - [`manager`]: `FileManager` and its builder
//! - [`registry`]: `ManagerRegistry` and the `ManagedEntry` trait
//! - [`backup`]: backup creation, listing and retention
//! - [`rollback`]: sequential-retry recovery
//! - [`triggers`]: backup triggers and their configuration
//! - [`remote`]: remote repository sync
//! - [`json_diff`]: structural JSON comparison
//! - [`serializer`]: value encodings
//! - [`events`]: event bus
//! - [`types`]: configuration and report types
//! - [`utils`]: hashing and atomic writes
//! - [`error`]: error types and handling

pub mod backup;
pub mod error;
pub mod events;
pub mod json_diff;
pub mod manager;
pub mod registry;
pub mod remote;
pub mod rollback;
pub mod serializer;
pub mod triggers;
pub mod types;
pub mod utils;

// Re-export main types
pub use backup::BackupStore;
pub use error::{Result, SafekeepError};
pub use events::{EventBus, FileEvent};
pub use json_diff::{ChangeKind, JsonDiffReport, PropertyChange};
pub use manager::{FileManager, FileManagerBuilder, RollbackCallback};
pub use registry::{ManagedEntry, ManagerRegistry};
pub use remote::{CheckOutcome, InMemoryRemoteRepository, RemoteRepository, RemoteSync};
pub use rollback::{RollbackDetails, RollbackEngine, RollbackOutcome};
pub use serializer::{BincodeSerializer, JsonSerializer, Serializer, TextSerializer};
pub use triggers::{BackupTrigger, Trigger, TriggerConfig};
pub use types::*;
