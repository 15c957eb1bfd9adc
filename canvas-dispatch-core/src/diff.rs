//! Structural diffing between state snapshots.
//!
//! The differ walks two JSON trees key by key and emits only leaf-level
//! changes; composite nodes present on both sides recurse without emitting a
//! parent-level change. Arrays are compared index-wise with no move
//! detection: a reorder shows up as N elementwise updates. That keeps every
//! change trivially invertible, which the history manager depends on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What happened at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The key exists only in the new snapshot.
    Create,
    /// The key exists in both snapshots with different leaf values.
    Update,
    /// The key exists only in the old snapshot.
    Delete,
}

/// One leaf-level difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Dot-separated path from the root, e.g. `components.c1.bounds.x`.
    pub path: String,
    /// Create, update or delete.
    pub kind: ChangeKind,
    /// Value before the change (`None` for creates).
    pub old: Option<Value>,
    /// Value after the change (`None` for deletes).
    pub new: Option<Value>,
}

impl Change {
    /// Swap a change into its inverse: create<->delete, update flips values.
    pub fn inverted(&self) -> Self {
        match self.kind {
            ChangeKind::Create => Self {
                path: self.path.clone(),
                kind: ChangeKind::Delete,
                old: self.new.clone(),
                new: None,
            },
            ChangeKind::Delete => Self {
                path: self.path.clone(),
                kind: ChangeKind::Create,
                old: None,
                new: self.old.clone(),
            },
            ChangeKind::Update => Self {
                path: self.path.clone(),
                kind: ChangeKind::Update,
                old: self.new.clone(),
                new: self.old.clone(),
            },
        }
    }
}

/// Compute the leaf-level changes turning `old` into `new`.
///
/// Diffing a snapshot against itself always yields an empty list.
pub fn diff(old: &Value, new: &Value) -> Vec<Change> {
    let mut changes = Vec::new();
    diff_at("", old, new, &mut changes);
    changes
}

/// Invert a forward change list for undo.
///
/// Changes are inverted individually and the order reversed so that
/// applying the result rolls back in last-in-first-out order.
pub fn invert(changes: &[Change]) -> Vec<Change> {
    changes.iter().rev().map(Change::inverted).collect()
}

/// Apply a change list to a JSON tree, producing the updated tree.
///
/// Missing intermediate objects are created on demand, so a change list can
/// be replayed onto any same-shaped base.
pub fn apply(mut value: Value, changes: &[Change]) -> Value {
    for change in changes {
        apply_one(&mut value, change);
    }
    value
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn diff_at(path: &str, old: &Value, new: &Value, out: &mut Vec<Change>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_val) in old_map {
                match new_map.get(key) {
                    Some(new_val) => diff_at(&join(path, key), old_val, new_val, out),
                    None => out.push(Change {
                        path: join(path, key),
                        kind: ChangeKind::Delete,
                        old: Some(old_val.clone()),
                        new: None,
                    }),
                }
            }
            for (key, new_val) in new_map {
                if !old_map.contains_key(key) {
                    out.push(Change {
                        path: join(path, key),
                        kind: ChangeKind::Create,
                        old: None,
                        new: Some(new_val.clone()),
                    });
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            let shared = old_items.len().min(new_items.len());
            for i in 0..shared {
                diff_at(&join(path, &i.to_string()), &old_items[i], &new_items[i], out);
            }
            // Tail deletes run highest-index first so that applying them one
            // by one never shifts a later target.
            for (i, old_val) in old_items.iter().enumerate().skip(shared).rev() {
                out.push(Change {
                    path: join(path, &i.to_string()),
                    kind: ChangeKind::Delete,
                    old: Some(old_val.clone()),
                    new: None,
                });
            }
            for (i, new_val) in new_items.iter().enumerate().skip(shared) {
                out.push(Change {
                    path: join(path, &i.to_string()),
                    kind: ChangeKind::Create,
                    old: None,
                    new: Some(new_val.clone()),
                });
            }
        }
        _ => {
            // Leaves, or a leaf/composite shape mismatch: report a single
            // update of the whole subtree.
            if old != new {
                out.push(Change {
                    path: path.to_string(),
                    kind: ChangeKind::Update,
                    old: Some(old.clone()),
                    new: Some(new.clone()),
                });
            }
        }
    }
}

fn apply_one(root: &mut Value, change: &Change) {
    let segments: Vec<&str> = change.path.split('.').collect();
    if segments.is_empty() {
        return;
    }
    let (last, parents) = segments.split_last().unwrap();

    let mut current = root;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => match segment.parse::<usize>() {
                Ok(i) if i < items.len() => &mut items[i],
                _ => return,
            },
            other => {
                *other = Value::Object(Map::new());
                match other {
                    Value::Object(map) => map
                        .entry(segment.to_string())
                        .or_insert_with(|| Value::Object(Map::new())),
                    _ => unreachable!(),
                }
            }
        };
    }

    match change.kind {
        ChangeKind::Create | ChangeKind::Update => {
            let new = change.new.clone().unwrap_or(Value::Null);
            match current {
                Value::Object(map) => {
                    map.insert(last.to_string(), new);
                }
                Value::Array(items) => match last.parse::<usize>() {
                    Ok(i) if i < items.len() => items[i] = new,
                    Ok(i) if i == items.len() => items.push(new),
                    _ => {}
                },
                other => {
                    let mut map = Map::new();
                    map.insert(last.to_string(), new);
                    *other = Value::Object(map);
                }
            }
        }
        ChangeKind::Delete => match current {
            Value::Object(map) => {
                map.remove(*last);
            }
            Value::Array(items) => {
                if let Ok(i) = last.parse::<usize>() {
                    if i < items.len() {
                        items.remove(i);
                    }
                }
            }
            _ => {}
        },
    }
}
