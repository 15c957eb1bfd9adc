//! Actions: descriptions of intended state mutations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Well-known action kinds handled by the built-in reducers.
pub mod kinds {
    /// Add a component (`payload: { id, kind?, name?, bounds, z_index?, props? }`).
    pub const ADD_COMPONENT: &str = "component/add";
    /// Update fields of an existing component (`payload: { id, ... }`).
    pub const UPDATE_COMPONENT: &str = "component/update";
    /// Remove a component (`payload: { id }`).
    pub const REMOVE_COMPONENT: &str = "component/remove";
    /// Replace the selection (`payload: { ids: [..] }`).
    pub const SET_SELECTION: &str = "selection/set";
    /// Clear the selection.
    pub const CLEAR_SELECTION: &str = "selection/clear";
    /// Update canvas settings (`payload: { zoom?, offset_x?, offset_y?, grid_visible? }`).
    pub const UPDATE_CANVAS: &str = "canvas/update";
    /// Switch the theme (`payload: { name }`).
    pub const SET_THEME: &str = "theme/set";
    /// Update project metadata (`payload: { name?, description? }`).
    pub const UPDATE_PROJECT: &str = "project/update";
    /// Update window settings (`payload: { width?, height?, title? }`).
    pub const UPDATE_WINDOW: &str = "window/update";
    /// Internal: apply the inverse changes of the current history entry.
    pub const HISTORY_UNDO: &str = "history/undo";
    /// Internal: re-apply the forward changes of the next history entry.
    pub const HISTORY_REDO: &str = "history/redo";
    /// Internal: open a history batch (`payload: { id }`).
    pub const HISTORY_BATCH_START: &str = "history/batch_start";
    /// Internal: close a history batch (`payload: { id }`).
    pub const HISTORY_BATCH_END: &str = "history/batch_end";
}

/// An intended mutation submitted to the engine.
///
/// Actions are created by callers, validated at dispatch, and consumed exactly
/// once by the dispatch worker. The `kind` tag selects the reducer; the
/// payload carries the reducer's input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Monotonically increasing id, assigned at construction.
    pub id: u64,
    /// Reducer lookup tag, e.g. `"component/add"`.
    pub kind: String,
    /// Reducer input. An object for most kinds, `null` for payload-free ones.
    pub payload: Value,
    /// Batch this action belongs to, if recorded as part of one.
    pub batch: Option<String>,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Action {
    /// Build an action with a fresh id and the current timestamp.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed),
            kind: kind.into(),
            payload,
            batch: None,
            timestamp: now_millis(),
        }
    }

    /// Tag this action with a batch id.
    pub fn with_batch(mut self, batch: impl Into<String>) -> Self {
        self.batch = Some(batch.into());
        self
    }

    /// Whether this is one of the internal history replay kinds.
    ///
    /// Replay actions are applied by the worker but never re-recorded into
    /// the history timeline.
    pub fn is_history_replay(&self) -> bool {
        self.kind == kinds::HISTORY_UNDO || self.kind == kinds::HISTORY_REDO
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
