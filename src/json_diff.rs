//! Structural diff of JSON documents
//!
//! This module compares two JSON documents and reports the properties that
//! were added, removed or modified, each addressed by a dotted/indexed path
//! such as `users[0].name`.
//!
//! ## Overview
//!
//! The walk is a straightforward recursive descent over both documents:
//!
//! - **Objects** are matched key by key. A key only in the new document is
//!   `Added`, a key only in the old document is `Removed`.
//! - **Arrays** are matched by position. Reordering an array is therefore
//!   reported as per-index modifications; elements are not matched by identity.
//! - **Everything else** (scalars, or two values of different JSON types) is
//!   compared for equality and reported as a single `Modified` change at the
//!   most specific path.
//!
//! A missing old document is treated as an empty object, so every top-level key
//! of the new document shows up as `Added`.
//!
//! ## Examples
//!
//! ```rust
//! use safekeep::json_diff::{diff, ChangeKind};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let report = diff(Some(r#"{"a":1}"#), r#"{"a":2,"b":3}"#)?;
//!
//! assert!(report.has_changes);
//! assert_eq!(report.changes.len(), 2);
//! assert_eq!(report.changes[0].path, "a");
//! assert_eq!(report.changes[0].kind, ChangeKind::Modified);
//! assert_eq!(report.changes[1].path, "b");
//! assert_eq!(report.changes[1].kind, ChangeKind::Added);
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Path used when the documents themselves are scalars that differ
pub const ROOT_PATH: &str = "$";

/// Kind of a property change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Present only in the new document
    Added,
    /// Present only in the old document
    Removed,
    /// Present in both with different values
    Modified,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Removed => write!(f, "removed"),
            ChangeKind::Modified => write!(f, "modified"),
        }
    }
}

/// One changed property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Dotted/indexed path, e.g. `users[0].name`
    pub path: String,
    /// What happened at this path
    pub kind: ChangeKind,
    /// Value before the change (absent for `Added`)
    pub old_value: Option<Value>,
    /// Value after the change (absent for `Removed`)
    pub new_value: Option<Value>,
}

impl fmt::Display for PropertyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ChangeKind::Added => write!(
                f,
                "+ {} = {}",
                self.path,
                self.new_value.as_ref().unwrap_or(&Value::Null)
            ),
            ChangeKind::Removed => write!(
                f,
                "- {} (was {})",
                self.path,
                self.old_value.as_ref().unwrap_or(&Value::Null)
            ),
            ChangeKind::Modified => write!(
                f,
                "~ {}: {} -> {}",
                self.path,
                self.old_value.as_ref().unwrap_or(&Value::Null),
                self.new_value.as_ref().unwrap_or(&Value::Null)
            ),
        }
    }
}

/// Ordered list of changes between two JSON documents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonDiffReport {
    /// Changes in walk order
    pub changes: Vec<PropertyChange>,
    /// Whether any change was found
    pub has_changes: bool,
}

impl JsonDiffReport {
    fn from_changes(changes: Vec<PropertyChange>) -> Self {
        let has_changes = !changes.is_empty();
        Self { changes, has_changes }
    }

    /// Number of changes of the given kind
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    /// One-line description, e.g. `2 added, 0 removed, 1 modified`
    pub fn summary(&self) -> String {
        format!(
            "{} added, {} removed, {} modified",
            self.count(ChangeKind::Added),
            self.count(ChangeKind::Removed),
            self.count(ChangeKind::Modified)
        )
    }
}

/// Diff two JSON texts
///
/// `old_json` may be absent, in which case it is treated as `{}`.
///
/// # Errors
///
/// - [`crate::SafekeepError::Decode`] if either document is not valid JSON
pub fn diff(old_json: Option<&str>, new_json: &str) -> Result<JsonDiffReport> {
    let old = match old_json {
        Some(text) if !text.trim().is_empty() => serde_json::from_str(text)?,
        _ => Value::Object(Map::new()),
    };
    let new: Value = serde_json::from_str(new_json)?;
    Ok(diff_values(&old, &new))
}

/// Diff two already parsed JSON values
pub fn diff_values(old: &Value, new: &Value) -> JsonDiffReport {
    let mut changes = Vec::new();
    walk("", old, new, &mut changes);
    JsonDiffReport::from_changes(changes)
}

/// Path of an object member below `parent`
fn key_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

/// Path of an array element below `parent`
fn index_path(parent: &str, index: usize) -> String {
    format!("{}[{}]", parent, index)
}

fn walk(path: &str, old: &Value, new: &Value, changes: &mut Vec<PropertyChange>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            walk_objects(path, old_map, new_map, changes)
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            walk_arrays(path, old_items, new_items, changes)
        }
        _ if old != new => changes.push(PropertyChange {
            path: if path.is_empty() { ROOT_PATH.to_string() } else { path.to_string() },
            kind: ChangeKind::Modified,
            old_value: Some(old.clone()),
            new_value: Some(new.clone()),
        }),
        _ => {}
    }
}

fn walk_objects(
    path: &str,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    changes: &mut Vec<PropertyChange>,
) {
    for (key, new_value) in new {
        let child = key_path(path, key);
        match old.get(key) {
            Some(old_value) => walk(&child, old_value, new_value, changes),
            None => changes.push(PropertyChange {
                path: child,
                kind: ChangeKind::Added,
                old_value: None,
                new_value: Some(new_value.clone()),
            }),
        }
    }

    for (key, old_value) in old {
        if !new.contains_key(key) {
            changes.push(PropertyChange {
                path: key_path(path, key),
                kind: ChangeKind::Removed,
                old_value: Some(old_value.clone()),
                new_value: None,
            });
        }
    }
}

fn walk_arrays(path: &str, old: &[Value], new: &[Value], changes: &mut Vec<PropertyChange>) {
    for index in 0..old.len().max(new.len()) {
        let child = index_path(path, index);
        match (old.get(index), new.get(index)) {
            (Some(old_value), Some(new_value)) => walk(&child, old_value, new_value, changes),
            (None, Some(new_value)) => changes.push(PropertyChange {
                path: child,
                kind: ChangeKind::Added,
                old_value: None,
                new_value: Some(new_value.clone()),
            }),
            (Some(old_value), None) => changes.push(PropertyChange {
                path: child,
                kind: ChangeKind::Removed,
                old_value: Some(old_value.clone()),
                new_value: None,
            }),
            (None, None) => {}
        }
    }
}
