//! Chaos testing for Safekeep
//!
//! Corrupts, deletes and races the files safekeep depends on and checks that
//! every failure stays contained to the file it happened to.

use ::safekeep::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;

/// Seeded source of damage
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Overwrite a few bytes with values that cannot appear in valid JSON text
    pub fn corrupt_json(&mut self, path: &Path) {
        let mut bytes = fs::read(path).unwrap();
        if bytes.is_empty() {
            bytes.push(0);
        }
        for _ in 0..3 {
            let at = self.rng.random_range(0..bytes.len());
            bytes[at] = 0xff;
        }
        fs::write(path, bytes).unwrap();
    }

    /// Cut a file somewhere before its end
    pub fn truncate(&mut self, path: &Path) {
        let bytes = fs::read(path).unwrap();
        let keep = self.rng.random_range(0..bytes.len().max(1));
        fs::write(path, &bytes[..keep]).unwrap();
    }
}

fn json_manager(dir: &Path, name: &str) -> FileManager<Value> {
    FileManager::builder(dir.join(name))
        .json()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_corrupt_file_recovers_from_backup() {
    let temp = TempDir::new().unwrap();
    let mut chaos = ChaosEngine::new(42);
    let manager = json_manager(temp.path(), "state.json");

    manager.save(json!({"level": 3, "items": ["sword"]})).await.unwrap();
    manager.create_backup().await.unwrap();
    chaos.corrupt_json(manager.path());

    assert!(matches!(
        manager.load().await.unwrap_err(),
        SafekeepError::Decode(_)
    ));

    let outcome = manager.restore().await.unwrap();
    assert_eq!(outcome.index(), Some(0));
    assert!(!outcome.is_rollback());
    assert_eq!(
        manager.load().await.unwrap(),
        json!({"level": 3, "items": ["sword"]})
    );
}

#[tokio::test]
async fn test_every_backup_damaged() {
    let temp = TempDir::new().unwrap();
    let mut chaos = ChaosEngine::new(7);
    let manager = json_manager(temp.path(), "doomed.json");

    for n in 0..4 {
        manager.save(json!({"n": n})).await.unwrap();
        manager.create_backup().await.unwrap();
    }
    for record in manager.list_backups().await.unwrap().iter().rev() {
        chaos.truncate(&record.path);
    }
    let before = fs::read(manager.path()).unwrap();

    let outcome = manager.restore().await.unwrap();
    let details = outcome.details();
    info!("Rollback reasons: {:?}", details.reasons);

    assert!(!outcome.is_recovered());
    assert_eq!(details.tried_paths.len(), 4);
    assert_eq!(details.reasons.len(), 4);
    assert!(details.successful_path.is_none());
    assert_eq!(fs::read(manager.path()).unwrap(), before);
}

#[tokio::test]
async fn test_vanished_backup_is_skipped() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let newest = temp.path().join("newest.json");
    let older = temp.path().join("older.json");
    fs::write(&older, "41")?;

    let outcome = RollbackEngine::new(RollbackOptions::default())
        .restore(&[newest.clone(), older.clone()], &JsonSerializer::<u32>::new())
        .await?;

    assert_eq!(outcome.index(), Some(1));
    let details = outcome.details();
    assert_eq!(details.tried_paths, vec![newest, older.clone()]);
    assert_eq!(details.successful_path, Some(older));
    assert_eq!(details.reasons.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_foreign_files_in_backup_dir_survive_pruning() {
    let temp = TempDir::new().unwrap();
    let manager = FileManager::<Value>::builder(temp.path().join("config.json"))
        .json()
        .backup_config(BackupConfig {
            max_backup_count: 1,
            ..Default::default()
        })
        .build()
        .unwrap();
    let foreign = [
        temp.path().join("config.json.bak"),
        temp.path().join("other.json_20240101_000000_000.bak"),
        temp.path().join("notes.txt"),
    ];
    for path in &foreign {
        fs::write(path, "keep me").unwrap();
    }

    for n in 0..3 {
        manager.save(json!(n)).await.unwrap();
        manager.create_backup().await.unwrap();
    }

    assert_eq!(manager.list_backups().await.unwrap().len(), 1);
    for path in &foreign {
        assert_eq!(fs::read_to_string(path).unwrap(), "keep me");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_saves_and_backups_never_tear() {
    let temp = TempDir::new().unwrap();
    let manager = FileManager::<Value>::builder(temp.path().join("busy.json"))
        .json()
        .backup_config(BackupConfig {
            max_backup_count: 100,
            ..Default::default()
        })
        .build()
        .unwrap();
    let payload = |n: usize| json!({"n": n, "blob": "x".repeat(4096 + n)});
    manager.save(payload(0)).await.unwrap();

    let mut tasks = Vec::new();
    for n in 1..=20 {
        let saver = manager.clone();
        tasks.push(tokio::spawn(async move {
            saver.save(payload(n)).await.map(|_| None)
        }));
        let backer = manager.clone();
        tasks.push(tokio::spawn(async move {
            backer.create_backup().await.map(Some)
        }));
    }

    let mut backups: Vec<PathBuf> = Vec::new();
    for task in tasks {
        if let Some(path) = task.await.unwrap().unwrap() {
            backups.push(path);
        }
    }

    assert_eq!(backups.len(), 20);
    let mut unique = backups.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 20, "backup names collided");

    for path in backups.iter().chain(std::iter::once(&manager.path().to_path_buf())) {
        let value: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        let n = value["n"].as_u64().unwrap() as usize;
        assert_eq!(value, payload(n), "torn content in {:?}", path);
    }
}

#[tokio::test]
async fn test_overlapping_sweeps_write_once() {
    let temp = TempDir::new().unwrap();
    let registry = ManagerRegistry::new();
    let manager = json_manager(temp.path(), "swept.json");
    registry.register(manager.clone());
    manager.mark_changed(json!({"swept": true}));

    let (a, b) = tokio::join!(registry.run_auto_save_sweep(), registry.run_auto_save_sweep());

    assert!(!(a.skipped && b.skipped));
    assert_eq!(a.flushed.len() + b.flushed.len(), 1);
    assert_eq!(manager.load().await.unwrap(), json!({"swept": true}));
    assert!(!manager.needs_auto_save());
}

#[tokio::test]
async fn test_remote_outage_leaves_local_file_alone() {
    let temp = TempDir::new().unwrap();
    let repo = Arc::new(InMemoryRemoteRepository::new());
    repo.put_file("acme", "cfg", "main", "flags.json", r#"{"beta":true}"#);
    repo.set_offline(true);

    let manager = FileManager::<Value>::builder(temp.path().join("flags.json"))
        .json()
        .remote(
            repo.clone(),
            RemoteSyncConfig {
                cache_duration: Duration::from_secs(3600),
                ..RemoteSyncConfig::new("acme", "cfg", "flags.json")
            },
        )
        .build()
        .unwrap();
    manager.save(json!({"beta": false})).await.unwrap();

    let err = manager.sync_remote().await.unwrap_err();
    assert!(matches!(err, SafekeepError::Network(_)));
    assert!(err.is_recoverable());
    assert_eq!(manager.load().await.unwrap(), json!({"beta": false}));
    assert!(manager.list_backups().await.unwrap().is_empty());

    // A failed check does not start the cache window
    repo.set_offline(false);
    let outcome = manager.sync_remote().await.unwrap();
    assert!(outcome.is_updated());
    assert_eq!(manager.load().await.unwrap(), json!({"beta": true}));
    assert_eq!(manager.list_backups().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_dropped_manager_stops_its_triggers() {
    let temp = TempDir::new().unwrap();
    let manager = FileManager::<Value>::builder(temp.path().join("brief.json"))
        .json()
        .trigger(Trigger::interval(Duration::from_millis(20)))
        .build()
        .unwrap();
    manager.save(json!(1)).await.unwrap();
    manager.activate_triggers();
    let backup_dir = manager.backup_store().backup_dir();
    let count_backups = || {
        fs::read_dir(&backup_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .count()
    };

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(count_backups() >= 1);

    drop(manager);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let settled = count_backups();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count_backups(), settled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aborted_sweeps_never_lose_changes() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(ManagerRegistry::new());
    let manager = json_manager(temp.path(), "interrupted.json");
    registry.register(manager.clone());
    let payload = |n: usize| json!({"n": n, "blob": "y".repeat(256 * 1024)});

    for n in 0..40 {
        manager.mark_changed(payload(n));
        let sweeper = registry.clone();
        let sweep = tokio::spawn(async move { sweeper.run_auto_save_sweep().await });
        while manager.needs_auto_save() && !sweep.is_finished() {
            tokio::task::yield_now().await;
        }
        sweep.abort();
        let _ = sweep.await;

        let on_disk: Value = serde_json::from_slice(&fs::read(manager.path()).unwrap()).unwrap();
        assert!(
            manager.needs_auto_save() || on_disk == payload(n),
            "change {} was dropped without reaching disk",
            n
        );
    }

    let report = registry.run_auto_save_sweep().await;
    assert!(!report.skipped);
    assert!(!manager.needs_auto_save());
    assert_eq!(manager.load().await.unwrap(), payload(39));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trigger_stopped_mid_backup_keeps_flag() {
    let temp = TempDir::new().unwrap();
    let mut chaos = ChaosEngine::new(1234);
    let manager = FileManager::<Value>::builder(temp.path().join("ticking.json"))
        .json()
        .trigger(Trigger::interval(Duration::from_millis(5)))
        .build()
        .unwrap();
    let payload = |n: usize| json!({"n": n, "blob": "z".repeat(128 * 1024)});

    for n in 0..20 {
        manager.save(payload(n)).await.unwrap();
        manager.activate_triggers();
        tokio::time::sleep(Duration::from_millis(chaos.rng.random_range(0..15))).await;
        manager.deactivate_triggers();
        // Let blocking I/O of an aborted backup settle
        tokio::time::sleep(Duration::from_millis(20)).await;

        if !manager.needs_backup() {
            let newest = &manager.list_backups().await.unwrap()[0];
            let backed_up: Value = serde_json::from_slice(&fs::read(&newest.path).unwrap()).unwrap();
            assert_eq!(backed_up, payload(n), "flag cleared without a backup of save {}", n);
        }
    }
}
