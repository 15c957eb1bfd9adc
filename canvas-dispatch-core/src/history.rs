//! Linear undo/redo timeline with batching and bounded eviction.

use serde::Serialize;

use crate::action::Action;
use crate::diff::{self, Change};
use crate::error::EngineError;

/// One recorded edit: the forward changes and their precomputed inverse.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Id of the recorded action (first action for batches).
    pub action_id: u64,
    /// Kind of the recorded action, or the batch id for batches.
    pub label: String,
    /// Changes that turn the pre-image into the post-image.
    pub forward: Vec<Change>,
    /// Changes that roll the post-image back.
    pub inverse: Vec<Change>,
    /// Estimated memory footprint in bytes.
    pub size_bytes: usize,
    /// Timestamp of the recorded action, ms since the Unix epoch.
    pub timestamp: u64,
    /// Batch id, when the entry coalesces several actions.
    pub batch: Option<String>,
}

/// Summary of an entry for timeline UIs.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineItem {
    /// Position in the timeline.
    pub index: usize,
    /// Entry label (action kind or batch id).
    pub label: String,
    /// Number of forward changes.
    pub change_count: usize,
    /// Estimated size in bytes.
    pub size_bytes: usize,
    /// Timestamp of the entry.
    pub timestamp: u64,
    /// Whether the cursor currently sits on this entry.
    pub is_current: bool,
}

#[derive(Debug)]
struct OpenBatch {
    id: String,
    first_action_id: Option<u64>,
    forward: Vec<Change>,
    inverse: Vec<Change>,
    timestamp: u64,
}

/// Undo/redo timeline.
///
/// Entries form a linear sequence with a cursor pointing at the last applied
/// entry (`-1` = before the first). Recording while the cursor is not at the
/// tail discards the redo branch. Eviction keeps both the entry count and
/// the estimated byte total within the configured bounds, always dropping
/// from the oldest end.
#[derive(Debug)]
pub struct HistoryManager {
    entries: Vec<HistoryEntry>,
    cursor: i64,
    max_entries: usize,
    max_bytes: usize,
    total_bytes: usize,
    open_batch: Option<OpenBatch>,
}

impl HistoryManager {
    /// Create a manager bounded by entry count and estimated bytes.
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: Vec::new(),
            cursor: -1,
            max_entries: max_entries.max(1),
            max_bytes,
            total_bytes: 0,
            open_batch: None,
        }
    }

    /// Record an action's forward changes, computing the inverse.
    ///
    /// Empty change lists record nothing. While a batch is open the changes
    /// are folded into the batch instead of producing an entry.
    pub fn record(&mut self, action: &Action, forward: Vec<Change>) {
        if forward.is_empty() {
            return;
        }
        let mut inverse = diff::invert(&forward);

        if let Some(batch) = self.open_batch.as_mut() {
            batch.first_action_id.get_or_insert(action.id);
            batch.forward.extend(forward);
            // Later actions must be undone first.
            inverse.extend(std::mem::take(&mut batch.inverse));
            batch.inverse = inverse;
            return;
        }

        let entry = HistoryEntry {
            action_id: action.id,
            label: action.kind.clone(),
            size_bytes: estimate_size(&forward, &inverse),
            forward,
            inverse,
            timestamp: action.timestamp,
            batch: None,
        };
        self.push_entry(entry);
    }

    /// Step the cursor back, returning the inverse changes to apply.
    pub fn undo(&mut self) -> Option<Vec<Change>> {
        if self.cursor < 0 {
            return None;
        }
        let entry = &self.entries[self.cursor as usize];
        let changes = entry.inverse.clone();
        self.cursor -= 1;
        tracing::debug!(label = %entry.label, cursor = self.cursor, "history undo");
        Some(changes)
    }

    /// Step the cursor forward, returning the forward changes to re-apply.
    pub fn redo(&mut self) -> Option<Vec<Change>> {
        if self.cursor + 1 >= self.entries.len() as i64 {
            return None;
        }
        self.cursor += 1;
        let entry = &self.entries[self.cursor as usize];
        tracing::debug!(label = %entry.label, cursor = self.cursor, "history redo");
        Some(entry.forward.clone())
    }

    /// Open a batch: subsequent records coalesce into one entry tagged `id`.
    pub fn start_batch(&mut self, id: impl Into<String>) -> Result<(), EngineError> {
        let id = id.into();
        if let Some(open) = &self.open_batch {
            return Err(EngineError::BatchAlreadyActive(open.id.clone()));
        }
        self.open_batch = Some(OpenBatch {
            id,
            first_action_id: None,
            forward: Vec::new(),
            inverse: Vec::new(),
            timestamp: now_millis(),
        });
        Ok(())
    }

    /// Close the batch with the given id, committing the coalesced entry.
    ///
    /// A batch that recorded nothing commits no entry.
    pub fn end_batch(&mut self, id: &str) -> Result<(), EngineError> {
        match self.open_batch.take() {
            Some(batch) if batch.id == id => {
                if batch.forward.is_empty() {
                    return Ok(());
                }
                let entry = HistoryEntry {
                    action_id: batch.first_action_id.unwrap_or(0),
                    label: batch.id.clone(),
                    size_bytes: estimate_size(&batch.forward, &batch.inverse),
                    forward: batch.forward,
                    inverse: batch.inverse,
                    timestamp: batch.timestamp,
                    batch: Some(batch.id),
                };
                self.push_entry(entry);
                Ok(())
            }
            Some(batch) => {
                // Wrong id: the open batch stays open.
                let err = EngineError::BatchNotActive(id.to_string());
                self.open_batch = Some(batch);
                Err(err)
            }
            None => Err(EngineError::BatchNotActive(id.to_string())),
        }
    }

    /// Whether a batch is currently open.
    pub fn batch_active(&self) -> bool {
        self.open_batch.is_some()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the timeline is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an undo step is available.
    pub fn can_undo(&self) -> bool {
        self.cursor >= 0
    }

    /// Whether a redo step is available.
    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.entries.len() as i64
    }

    /// Current cursor position (`-1` = before the first entry).
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Estimated total footprint of the timeline in bytes.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// A window of timeline summaries starting at `start`.
    pub fn timeline(&self, start: usize, limit: usize) -> Vec<TimelineItem> {
        self.entries
            .iter()
            .enumerate()
            .skip(start)
            .take(limit)
            .map(|(index, entry)| TimelineItem {
                index,
                label: entry.label.clone(),
                change_count: entry.forward.len(),
                size_bytes: entry.size_bytes,
                timestamp: entry.timestamp,
                is_current: index as i64 == self.cursor,
            })
            .collect()
    }

    /// Drop all entries and any open batch.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = -1;
        self.total_bytes = 0;
        self.open_batch = None;
    }

    fn push_entry(&mut self, entry: HistoryEntry) {
        // New edits discard the redo branch.
        let keep = (self.cursor + 1) as usize;
        for dropped in self.entries.drain(keep..) {
            self.total_bytes -= dropped.size_bytes;
        }

        self.total_bytes += entry.size_bytes;
        self.entries.push(entry);
        self.cursor = self.entries.len() as i64 - 1;

        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.max_entries
            || (self.total_bytes > self.max_bytes && self.entries.len() > 1)
        {
            let dropped = self.entries.remove(0);
            self.total_bytes -= dropped.size_bytes;
            self.cursor = (self.cursor - 1).max(-1);
            tracing::debug!(label = %dropped.label, "evicted oldest history entry");
        }
    }
}

fn estimate_size(forward: &[Change], inverse: &[Change]) -> usize {
    let ser = |changes: &[Change]| {
        serde_json::to_string(changes)
            .map(|s| s.len())
            .unwrap_or(0)
    };
    ser(forward) + ser(inverse)
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ChangeKind;
    use serde_json::json;

    fn change(path: &str, old: i64, new: i64) -> Change {
        Change {
            path: path.to_string(),
            kind: ChangeKind::Update,
            old: Some(json!(old)),
            new: Some(json!(new)),
        }
    }

    fn action(kind: &str) -> Action {
        Action::new(kind, json!({}))
    }

    #[test]
    fn test_record_undo_redo() {
        let mut history = HistoryManager::new(100, usize::MAX);
        history.record(&action("a"), vec![change("x", 0, 1)]);
        history.record(&action("b"), vec![change("x", 1, 2)]);

        assert!(history.can_undo());
        let inverse = history.undo().unwrap();
        assert_eq!(inverse[0].old, Some(json!(2)));
        assert_eq!(inverse[0].new, Some(json!(1)));

        let forward = history.redo().unwrap();
        assert_eq!(forward[0].new, Some(json!(2)));
        assert!(!history.can_redo());
    }

    #[test]
    fn test_undo_at_beginning_is_noop() {
        let mut history = HistoryManager::new(10, usize::MAX);
        assert!(history.undo().is_none());
        history.record(&action("a"), vec![change("x", 0, 1)]);
        assert!(history.undo().is_some());
        assert!(history.undo().is_none());
    }

    #[test]
    fn test_record_truncates_redo_branch() {
        let mut history = HistoryManager::new(10, usize::MAX);
        history.record(&action("a"), vec![change("x", 0, 1)]);
        history.record(&action("b"), vec![change("x", 1, 2)]);
        history.undo();

        history.record(&action("c"), vec![change("x", 1, 7)]);
        assert_eq!(history.len(), 2);
        assert!(!history.can_redo());
        assert_eq!(history.timeline(0, 10)[1].label, "c");
    }

    #[test]
    fn test_empty_changes_not_recorded() {
        let mut history = HistoryManager::new(10, usize::MAX);
        history.record(&action("a"), vec![]);
        assert!(history.is_empty());
    }

    #[test]
    fn test_count_eviction_keeps_cursor_valid() {
        let mut history = HistoryManager::new(3, usize::MAX);
        for i in 0..10 {
            history.record(&action("a"), vec![change("x", i, i + 1)]);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.cursor(), 2);
        // Cursor still references the newest surviving entry.
        let inverse = history.undo().unwrap();
        assert_eq!(inverse[0].new, Some(json!(9)));
    }

    #[test]
    fn test_byte_eviction() {
        let mut history = HistoryManager::new(1000, 1);
        history.record(&action("a"), vec![change("x", 0, 1)]);
        history.record(&action("b"), vec![change("x", 1, 2)]);
        // Budget of one byte still retains the newest entry.
        assert_eq!(history.len(), 1);
        assert_eq!(history.timeline(0, 10)[0].label, "b");
    }

    #[test]
    fn test_batch_coalesces() {
        let mut history = HistoryManager::new(10, usize::MAX);
        history.start_batch("drag").unwrap();
        history.record(&action("a"), vec![change("x", 0, 1)]);
        history.record(&action("b"), vec![change("y", 0, 5)]);
        history.end_batch("drag").unwrap();

        assert_eq!(history.len(), 1);
        let inverse = history.undo().unwrap();
        // Second action's inverse comes first.
        assert_eq!(inverse[0].path, "y");
        assert_eq!(inverse[1].path, "x");
    }

    #[test]
    fn test_nested_batch_rejected() {
        let mut history = HistoryManager::new(10, usize::MAX);
        history.start_batch("one").unwrap();
        assert!(matches!(
            history.start_batch("two"),
            Err(EngineError::BatchAlreadyActive(_))
        ));
        history.end_batch("one").unwrap();
    }

    #[test]
    fn test_end_batch_wrong_id() {
        let mut history = HistoryManager::new(10, usize::MAX);
        history.start_batch("one").unwrap();
        assert!(matches!(
            history.end_batch("two"),
            Err(EngineError::BatchNotActive(_))
        ));
        // The original batch is still open and can be closed.
        assert!(history.batch_active());
        history.end_batch("one").unwrap();
    }

    #[test]
    fn test_empty_batch_records_nothing() {
        let mut history = HistoryManager::new(10, usize::MAX);
        history.start_batch("noop").unwrap();
        history.end_batch("noop").unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn test_timeline_window() {
        let mut history = HistoryManager::new(10, usize::MAX);
        for i in 0..5 {
            history.record(&action(&format!("a{i}")), vec![change("x", i, i + 1)]);
        }
        let items = history.timeline(1, 2);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].index, 1);
        assert_eq!(items[1].index, 2);
        assert!(history.timeline(4, 10)[0].is_current);
    }
}
