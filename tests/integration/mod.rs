//! End-to-end scenarios for Safekeep
//!
//! These tests run on real time and real files: triggers fire from tokio
//! tasks, so every wait is bounded by a timeout instead of a fixed sleep.

use ::safekeep::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub theme: String,
    pub volume: u32,
}

impl Settings {
    pub fn with_volume(volume: u32) -> Self {
        Self {
            theme: "dark".to_string(),
            volume,
        }
    }
}

/// Temp directory plus a registry sharing one event bus
pub struct SafekeepTestHarness {
    pub temp_dir: TempDir,
    pub registry: Arc<ManagerRegistry>,
}

impl SafekeepTestHarness {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
            registry: Arc::new(ManagerRegistry::new()),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// JSON settings manager on the shared bus, not yet registered
    pub fn settings_manager(&self, name: &str, backup: BackupConfig, triggers: Vec<Trigger>) -> FileManager<Settings> {
        FileManager::builder(self.path(name))
            .json()
            .backup_config(backup)
            .triggers(triggers)
            .events(self.registry.events().clone())
            .build()
            .unwrap()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.registry.events().subscribe()
    }
}

/// Wait for the next event matching `pick`
pub async fn wait_for<R>(
    rx: &mut broadcast::Receiver<FileEvent>,
    mut pick: impl FnMut(FileEvent) -> Option<R>,
) -> R {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive in time")
}

pub async fn wait_for_backup(rx: &mut broadcast::Receiver<FileEvent>, path: &Path) -> PathBuf {
    wait_for(rx, |event| match event {
        FileEvent::BackupCreated {
            path: p,
            backup_path,
        } if p == path => Some(backup_path),
        _ => None,
    })
    .await
}

/// Poll `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn read_settings(path: &Path) -> Settings {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_on_save_backups_respect_retention() {
    let harness = SafekeepTestHarness::new();
    let manager = harness.settings_manager(
        "settings.json",
        BackupConfig {
            max_backup_count: 3,
            ..Default::default()
        },
        vec![Trigger::on_save()],
    );
    harness.registry.register(manager.clone());
    let mut events = harness.subscribe();

    for volume in 1..=4 {
        manager.save(Settings::with_volume(volume)).await.unwrap();
        wait_for_backup(&mut events, manager.path()).await;
    }

    let backups = manager.list_backups().await.unwrap();
    assert_eq!(backups.len(), 3);
    let volumes: Vec<u32> = backups.iter().map(|b| read_settings(&b.path).volume).collect();
    assert_eq!(volumes, vec![4, 3, 2]);

    assert_eq!(manager.load().await.unwrap(), Settings::with_volume(4));
    eventually(|| !manager.needs_backup()).await;

    harness.registry.shutdown();
}

#[tokio::test]
async fn test_auto_save_sweep_flushes_pending_changes() {
    let harness = SafekeepTestHarness::new();
    let manager = harness.settings_manager("auto.json", BackupConfig::default(), Vec::new());
    manager.save(Settings::with_volume(1)).await.unwrap();
    harness.registry.register(manager.clone());
    let mut events = harness.subscribe();

    manager.mark_changed(Settings::with_volume(2));
    assert!(manager.needs_auto_save());
    harness.registry.start_auto_save(Duration::from_millis(50));
    assert!(harness.registry.is_auto_save_running());

    let flushed = manager.path().to_path_buf();
    wait_for(&mut events, |event| match event {
        FileEvent::AutoSaveCompleted { path } if path == flushed => Some(()),
        _ => None,
    })
    .await;

    assert_eq!(read_settings(manager.path()), Settings::with_volume(2));
    assert!(!manager.needs_auto_save());
    // Still owed a backup: auto-save only clears its own flag
    assert!(manager.needs_backup());

    harness.registry.stop_auto_save();
    assert!(!harness.registry.is_auto_save_running());
}

#[tokio::test]
async fn test_sweep_isolates_failing_file() {
    let harness = SafekeepTestHarness::new();
    let good = harness.settings_manager("good.json", BackupConfig::default(), Vec::new());
    let blocked_dir = harness.path("blocked");
    fs::create_dir(&blocked_dir).unwrap();
    // A directory squatting on the target path makes the rename fail
    let bad_path = blocked_dir.join("bad.json");
    fs::create_dir(&bad_path).unwrap();
    let bad = FileManager::<Settings>::builder(&bad_path)
        .json()
        .events(harness.registry.events().clone())
        .build()
        .unwrap();

    harness.registry.register(good.clone());
    harness.registry.register(bad.clone());
    good.mark_changed(Settings::with_volume(10));
    bad.mark_changed(Settings::with_volume(20));

    let report = harness.registry.run_auto_save_sweep().await;

    assert_eq!(report.flushed, vec![good.path().to_path_buf()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, bad.path());
    assert_eq!(read_settings(good.path()), Settings::with_volume(10));
    assert!(bad.needs_auto_save());
}

#[tokio::test]
async fn test_incremental_backup_only_touches_changed_files() {
    let harness = SafekeepTestHarness::new();
    let first = harness.settings_manager("first.json", BackupConfig::default(), Vec::new());
    let second = harness.settings_manager("second.json", BackupConfig::default(), Vec::new());
    first.save(Settings::with_volume(1)).await.unwrap();
    second.save(Settings::with_volume(2)).await.unwrap();
    second.create_backup().await.unwrap();
    harness.registry.register(first.clone());
    harness.registry.register(second.clone());

    let report = harness.registry.backup_incremental().await;
    assert!(report.is_success());
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].path, first.path());
    assert!(!first.needs_backup());

    let report = harness.registry.backup_all().await;
    assert_eq!(report.total(), 2);
    assert_eq!(first.list_backups().await.unwrap().len(), 2);
    assert_eq!(second.list_backups().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rollback_skips_corrupt_backups() {
    let harness = SafekeepTestHarness::new();
    let manager = harness.settings_manager("rollback.json", BackupConfig::default(), Vec::new());
    let mut events = harness.subscribe();

    let mut backups = Vec::new();
    for volume in 1..=3 {
        manager.save(Settings::with_volume(volume)).await.unwrap();
        backups.push(manager.create_backup().await.unwrap());
    }
    // Newest two are unreadable; rewritten oldest first to keep their order
    fs::write(&backups[1], "").unwrap();
    fs::write(&backups[2], "{ not json").unwrap();
    fs::write(manager.path(), "garbage").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let callback: RollbackCallback = Arc::new(move |details: &RollbackDetails| {
        assert_eq!(details.tried_paths.len(), 3);
        assert_eq!(details.reasons.len(), 2);
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let outcome = manager
        .restore_with_rollback(RollbackOptions::default(), Some(callback))
        .await
        .unwrap();

    assert_eq!(outcome.index(), Some(2));
    assert!(outcome.is_rollback());
    assert_eq!(outcome.into_value(), Some(Settings::with_volume(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(read_settings(manager.path()), Settings::with_volume(1));
    assert_eq!(manager.cached(), Some(Settings::with_volume(1)));

    let successful = wait_for(&mut events, |event| match event {
        FileEvent::BackupRollback {
            successful_path, ..
        } => Some(successful_path),
        _ => None,
    })
    .await;
    assert_eq!(successful.as_deref(), Some(backups[0].as_path()));
}

#[tokio::test]
async fn test_rollback_retry_limit() {
    let harness = SafekeepTestHarness::new();
    let manager = harness.settings_manager("limited.json", BackupConfig::default(), Vec::new());

    let mut backups = Vec::new();
    for volume in 1..=3 {
        manager.save(Settings::with_volume(volume)).await.unwrap();
        backups.push(manager.create_backup().await.unwrap());
    }
    fs::write(&backups[1], "y").unwrap();
    fs::write(&backups[2], "x").unwrap();

    let options = RollbackOptions {
        max_retries: 1,
        ..Default::default()
    };
    let outcome = manager.restore_with_rollback(options, None).await.unwrap();

    assert!(!outcome.is_recovered());
    assert_eq!(outcome.details().tried_paths, vec![backups[2].clone(), backups[1].clone()]);
    // Nothing restored, so the file is untouched
    assert_eq!(read_settings(manager.path()), Settings::with_volume(3));
}

#[tokio::test]
async fn test_on_modified_debounces_bursts() {
    let harness = SafekeepTestHarness::new();
    let manager = harness.settings_manager(
        "burst.json",
        BackupConfig::default(),
        vec![Trigger::on_modified(Duration::from_millis(200))],
    );
    harness.registry.register(manager.clone());
    let mut events = harness.subscribe();

    for volume in 1..=3 {
        manager.save(Settings::with_volume(volume)).await.unwrap();
    }
    let backup = wait_for_backup(&mut events, manager.path()).await;
    assert_eq!(read_settings(&backup), Settings::with_volume(3));

    sleep(Duration::from_millis(400)).await;
    assert_eq!(manager.list_backups().await.unwrap().len(), 1);

    harness.registry.shutdown();
}

#[tokio::test]
async fn test_shutdown_stops_triggers() {
    let harness = SafekeepTestHarness::new();
    let manager = harness.settings_manager(
        "quiet.json",
        BackupConfig::default(),
        vec![Trigger::on_save()],
    );
    harness.registry.register(manager.clone());
    assert!(manager.triggers().iter().all(|t| t.is_active()));

    harness.registry.shutdown();

    assert!(harness.registry.is_empty());
    assert!(manager.triggers().iter().all(|t| !t.is_active()));
    manager.save(Settings::with_volume(1)).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(manager.list_backups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_register_replaces_previous_manager() {
    let harness = SafekeepTestHarness::new();
    let old = harness.settings_manager("same.json", BackupConfig::default(), vec![Trigger::on_save()]);
    let new = harness.settings_manager("same.json", BackupConfig::default(), vec![Trigger::on_save()]);

    harness.registry.register(old.clone());
    harness.registry.register(new.clone());

    assert_eq!(harness.registry.len(), 1);
    assert!(old.triggers().iter().all(|t| !t.is_active()));
    assert!(new.triggers().iter().all(|t| t.is_active()));
    assert!(harness.registry.unregister(new.path()));
    assert!(!harness.registry.unregister(new.path()));
}

#[tokio::test]
async fn test_registering_same_instance_again_keeps_it_live() {
    let harness = SafekeepTestHarness::new();
    let manager = harness.settings_manager("again.json", BackupConfig::default(), vec![Trigger::on_save()]);
    let mut events = harness.subscribe();

    harness.registry.register(manager.clone());
    harness.registry.register(manager.clone());

    assert!(harness.registry.contains(manager.path()));
    assert!(manager.triggers().iter().all(|t| t.is_active()));
    manager.save(Settings::with_volume(9)).await.unwrap();
    let backup = wait_for_backup(&mut events, manager.path()).await;
    assert_eq!(read_settings(&backup), Settings::with_volume(9));

    harness.registry.shutdown();
}

#[tokio::test]
async fn test_config_file_drives_manager() {
    let harness = SafekeepTestHarness::new();
    let config_path = harness.path("safekeep.json");
    fs::write(
        &config_path,
        r#"{
            "backup": { "max_backup_count": 2, "filename_pattern": "{stem}-{timestamp}.{ext}", "backup_dir": "history" },
            "triggers": [ { "kind": "on_save" } ]
        }"#,
    )
    .unwrap();
    let config = SafekeepConfig::from_file(&config_path).unwrap();

    let mut backup = config.backup.clone();
    backup.backup_dir = Some(harness.path("history"));
    let manager = FileManager::<Settings>::builder(harness.path("profile.json"))
        .json()
        .config(&config)
        .backup_config(backup)
        .events(harness.registry.events().clone())
        .build()
        .unwrap();
    harness.registry.register(manager.clone());
    let mut events = harness.subscribe();

    manager.save(Settings::with_volume(5)).await.unwrap();
    let backup_path = wait_for_backup(&mut events, manager.path()).await;

    assert_eq!(backup_path.parent(), Some(harness.path("history").as_path()));
    let name = backup_path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("profile-") && name.ends_with(".json"), "{}", name);

    harness.registry.shutdown();
}

#[tokio::test]
async fn test_remote_identical_content_downloads_nothing() {
    let harness = SafekeepTestHarness::new();
    let repo = Arc::new(InMemoryRemoteRepository::new());
    let content = serde_json::to_vec(&Settings::with_volume(7)).unwrap();
    repo.put_file("acme", "configs", "main", "app/settings.json", content.clone());

    let path = harness.path("remote.json");
    fs::write(&path, &content).unwrap();
    let manager = FileManager::<Settings>::builder(&path)
        .json()
        .remote(
            repo.clone(),
            RemoteSyncConfig {
                cache_duration: Duration::ZERO,
                ..RemoteSyncConfig::new("acme", "configs", "app/settings.json")
            },
        )
        .events(harness.registry.events().clone())
        .build()
        .unwrap();
    harness.registry.register(manager.clone());

    let report = harness.registry.sync_all().await;

    assert_eq!(report.unchanged, vec![path.clone()]);
    assert_eq!(repo.content_calls(), 0);
    assert!(manager.list_backups().await.unwrap().is_empty());
    harness.registry.shutdown();
}

#[tokio::test]
async fn test_remote_wins_over_local_edits() {
    let harness = SafekeepTestHarness::new();
    let repo = Arc::new(InMemoryRemoteRepository::new());
    repo.put_file(
        "acme",
        "configs",
        "main",
        "app/settings.json",
        serde_json::to_vec(&json!({"theme": "light", "volume": 9})).unwrap(),
    );

    let manager = FileManager::<Settings>::builder(harness.path("wins.json"))
        .json()
        .remote(
            repo.clone(),
            RemoteSyncConfig {
                cache_duration: Duration::ZERO,
                ..RemoteSyncConfig::new("acme", "configs", "app/settings.json")
            },
        )
        .build()
        .unwrap();
    manager.save(Settings::with_volume(1)).await.unwrap();
    manager.mark_changed(Settings::with_volume(2));

    let outcome = manager.sync_remote().await.unwrap();

    let CheckOutcome::Updated { backup_path, diff } = outcome else {
        panic!("expected the remote to win");
    };
    assert_eq!(read_settings(&backup_path.unwrap()), Settings::with_volume(1));
    assert_eq!(diff.unwrap().count(ChangeKind::Modified), 2);
    // Pending local edit is dropped in favour of the remote
    assert!(!manager.needs_auto_save());
    assert!(manager.cached().is_none());
    assert_eq!(
        manager.load().await.unwrap(),
        Settings {
            theme: "light".to_string(),
            volume: 9
        }
    );

    // Same push again: timestamp check stops before hashing
    let hashes = repo.hash_calls();
    assert_eq!(manager.sync_remote().await.unwrap(), CheckOutcome::NoChanges);
    assert_eq!(repo.hash_calls(), hashes);
}
