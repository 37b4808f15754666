//! Property-based testing for Safekeep
//!
//! Uses proptest to verify invariants across randomly generated values,
//! backup histories and JSON documents.

use ::safekeep::json_diff::{diff_values, ChangeKind};
use ::safekeep::triggers::next_occurrence;
use ::safekeep::utils::{hash_data, hash_file_content, hashes_match};
use ::safekeep::*;
use chrono::{Datelike, NaiveTime, TimeZone, Utc, Weekday};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Document {
    title: String,
    revision: u64,
    tags: Vec<String>,
    scores: BTreeMap<String, i64>,
}

fn document_strategy() -> impl Strategy<Value = Document> {
    (
        "[a-zA-Z0-9 ]{0,40}",
        any::<u64>(),
        prop::collection::vec("[a-z]{1,8}", 0..6),
        prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..6),
    )
        .prop_map(|(title, revision, tags, scores)| Document {
            title,
            revision,
            tags,
            scores,
        })
}

/// Flat JSON objects with small integer values
fn flat_object_strategy() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map("[a-e]", 0i64..4, 0..5)
}

fn to_value(map: &BTreeMap<String, i64>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect::<Map<String, Value>>(),
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// What was saved is what loads back, for both encodings
    #[test]
    fn save_load_identity(doc in document_strategy()) {
        let temp = TempDir::new().unwrap();
        runtime().block_on(async {
            let json = FileManager::<Document>::builder(temp.path().join("doc.json"))
                .json()
                .build()
                .unwrap();
            json.save(doc.clone()).await.unwrap();
            assert_eq!(json.load().await.unwrap(), doc.clone());

            let binary = FileManager::<Document>::builder(temp.path().join("doc.bin"))
                .serializer(BincodeSerializer::new())
                .build()
                .unwrap();
            binary.save(doc.clone()).await.unwrap();
            assert_eq!(binary.load().await.unwrap(), doc);
        });
    }

    /// Retention keeps exactly the newest `max` backups
    #[test]
    fn retention_keeps_newest(saves in 1usize..8, max in 1usize..5) {
        let temp = TempDir::new().unwrap();
        let contents = runtime().block_on(async {
            let manager = FileManager::<String>::builder(temp.path().join("notes.txt"))
                .serializer(TextSerializer)
                .backup_config(BackupConfig {
                    max_backup_count: max,
                    ..Default::default()
                })
                .build()
                .unwrap();

            for n in 1..=saves {
                manager.save(format!("save {}", n)).await.unwrap();
                manager.create_backup().await.unwrap();
            }

            manager
                .list_backups()
                .await
                .unwrap()
                .into_iter()
                .map(|record| fs::read_to_string(record.path).unwrap())
                .collect::<Vec<_>>()
        });

        let expected: Vec<String> = (1..=saves)
            .rev()
            .take(max)
            .map(|n| format!("save {}", n))
            .collect();
        prop_assert_eq!(contents, expected);
    }

    /// Rollback lands on the first readable backup, in order
    #[test]
    fn rollback_picks_first_readable(corrupt in prop::collection::vec(any::<bool>(), 1..8)) {
        let temp = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = corrupt
            .iter()
            .enumerate()
            .map(|(i, &bad)| {
                let path = temp.path().join(format!("backup_{}.json", i));
                let content = if bad { "{ broken".to_string() } else { i.to_string() };
                fs::write(&path, content).unwrap();
                path
            })
            .collect();

        let outcome = runtime()
            .block_on(RollbackEngine::new(RollbackOptions::default()).restore(
                &paths,
                &JsonSerializer::<usize>::new(),
            ))
            .unwrap();

        match corrupt.iter().position(|&bad| !bad) {
            Some(first_good) => {
                prop_assert_eq!(outcome.index(), Some(first_good));
                prop_assert_eq!(outcome.details().tried_paths.len(), first_good + 1);
                prop_assert_eq!(outcome.into_value(), Some(first_good));
            }
            None => {
                prop_assert!(!outcome.is_recovered());
                prop_assert_eq!(outcome.details().reasons.len(), corrupt.len());
            }
        }
    }

    /// A document never differs from itself
    #[test]
    fn diff_of_identical_documents_is_empty(doc in document_strategy()) {
        let value = serde_json::to_value(&doc).unwrap();
        let report = diff_values(&value, &value);
        prop_assert!(!report.has_changes);
        prop_assert!(report.changes.is_empty());
    }

    /// Flat object diffs classify every key exactly once
    #[test]
    fn diff_classifies_flat_keys(old in flat_object_strategy(), new in flat_object_strategy()) {
        let report = diff_values(&to_value(&old), &to_value(&new));

        let added = new.keys().filter(|k| !old.contains_key(*k)).count();
        let removed = old.keys().filter(|k| !new.contains_key(*k)).count();
        let modified = new
            .iter()
            .filter(|(k, v)| old.get(*k).is_some_and(|o| o != *v))
            .count();

        prop_assert_eq!(report.count(ChangeKind::Added), added);
        prop_assert_eq!(report.count(ChangeKind::Removed), removed);
        prop_assert_eq!(report.count(ChangeKind::Modified), modified);
        prop_assert_eq!(report.has_changes, added + removed + modified > 0);
    }

    /// File hashes agree with in-memory hashes, in any letter case
    #[test]
    fn file_hash_matches_data_hash(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob");
        fs::write(&path, &data).unwrap();

        let from_file = hash_file_content(&path).unwrap();
        let from_memory = hash_data(&data);
        prop_assert_eq!(&from_file, &from_memory);
        prop_assert!(hashes_match(&from_file.to_uppercase(), &from_memory));
    }

    /// The next scheduled run is in the future, at the right time and day
    #[test]
    fn next_occurrence_is_next_matching_slot(
        start in 0i64..(4 * 365 * 24 * 3600),
        hour in 0u32..24,
        minute in 0u32..60,
        weekday in prop::option::of(0u8..7),
    ) {
        let now = Utc.timestamp_opt(1_700_000_000 + start, 0).unwrap();
        let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap();
        let weekday = weekday.map(|d| Weekday::try_from(d).unwrap());

        let next = next_occurrence(&now, time, weekday);

        prop_assert!(next > now);
        prop_assert_eq!(next.time(), time);
        let horizon = if weekday.is_some() { 7 } else { 1 };
        prop_assert!(next - now <= chrono::Duration::days(horizon));
        if let Some(day) = weekday {
            prop_assert_eq!(next.weekday(), day);
        }
    }
}
