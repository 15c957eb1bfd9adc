//! Uniform hash-grid spatial index for component hit-testing.
//!
//! The grid trades the exactness of a tree for simple, fast average-case
//! queries: each box is registered in every cell it spans, queries gather
//! candidates from the relevant cells (broad phase) and confirm them with a
//! precise geometric test (exact phase).

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::bounds::BoundingBox;
use crate::diff::{Change, ChangeKind};

/// Runtime statistics for cell-size tuning.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatistics {
    /// Number of indexed components.
    pub component_count: usize,
    /// Number of non-empty cells.
    pub cell_count: usize,
    /// Average components per non-empty cell.
    pub avg_per_cell: f64,
    /// Largest cell population.
    pub max_per_cell: usize,
    /// Configured cell size.
    pub cell_size: f64,
}

/// Grid-based index over component bounding boxes.
#[derive(Debug)]
pub struct SpatialIndex {
    cell_size: f64,
    bounds: HashMap<String, BoundingBox>,
    cells: HashMap<(i64, i64), HashSet<String>>,
}

impl SpatialIndex {
    /// Create an index with the given cell size (must be positive).
    pub fn new(cell_size: f64) -> Self {
        debug_assert!(cell_size > 0.0, "cell size must be positive");
        Self {
            cell_size,
            bounds: HashMap::new(),
            cells: HashMap::new(),
        }
    }

    #[inline]
    fn cell_coord(&self, v: f64) -> i64 {
        (v / self.cell_size).floor() as i64
    }

    /// Cells spanned by a box, inclusive on both edges.
    fn cells_for(&self, bbox: &BoundingBox) -> Vec<(i64, i64)> {
        let min_x = self.cell_coord(bbox.left());
        let max_x = self.cell_coord(bbox.right());
        let min_y = self.cell_coord(bbox.top());
        let max_y = self.cell_coord(bbox.bottom());
        let mut out = Vec::with_capacity(((max_x - min_x + 1) * (max_y - min_y + 1)) as usize);
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                out.push((x, y));
            }
        }
        out
    }

    /// Register a component's bounds.
    ///
    /// Inserting an id that is already present replaces its bounds.
    pub fn insert(&mut self, id: impl Into<String>, bbox: BoundingBox) {
        let id = id.into();
        if self.bounds.contains_key(&id) {
            self.remove_memberships(&id);
        }
        for key in self.cells_for(&bbox) {
            self.cells.entry(key).or_default().insert(id.clone());
        }
        self.bounds.insert(id, bbox);
    }

    /// Move a component to new bounds.
    ///
    /// An update for an unknown id is recovered by treating it as an insert.
    pub fn update(&mut self, id: &str, bbox: BoundingBox) {
        if !self.bounds.contains_key(id) {
            tracing::warn!(id, "update for unindexed component, recovering as insert");
        }
        self.insert(id.to_string(), bbox);
    }

    /// Remove a component. Removing an unknown id is a logged no-op.
    pub fn remove(&mut self, id: &str) {
        if self.bounds.contains_key(id) {
            self.remove_memberships(id);
            self.bounds.remove(id);
        } else {
            tracing::debug!(id, "remove for unindexed component, ignoring");
        }
    }

    // Broad phase: unique candidate ids from every cell the rect spans.
    fn candidates_in(&self, rect: &BoundingBox) -> HashSet<String> {
        let mut candidates = HashSet::new();
        for key in self.cells_for(rect) {
            if let Some(cell) = self.cells.get(&key) {
                candidates.extend(cell.iter().cloned());
            }
        }
        candidates
    }

    fn remove_memberships(&mut self, id: &str) {
        let Some(bbox) = self.bounds.get(id).copied() else {
            return;
        };
        for key in self.cells_for(&bbox) {
            if let Some(cell) = self.cells.get_mut(&key) {
                cell.remove(id);
                if cell.is_empty() {
                    self.cells.remove(&key);
                }
            }
        }
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.bounds.clear();
        self.cells.clear();
    }

    /// Number of indexed components.
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Stored bounds for an id.
    pub fn bounds_of(&self, id: &str) -> Option<BoundingBox> {
        self.bounds.get(id).copied()
    }

    /// Ids whose boxes contain the point (half-open containment).
    pub fn query_point(&self, x: f64, y: f64) -> Vec<String> {
        let key = (self.cell_coord(x), self.cell_coord(y));
        let mut hits: Vec<String> = self
            .cells
            .get(&key)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.bounds
                    .get(*id)
                    .is_some_and(|b| b.contains_point(x, y))
            })
            .cloned()
            .collect();
        hits.sort();
        hits
    }

    /// Ids whose boxes intersect the rectangle.
    pub fn query_region(&self, rect: &BoundingBox) -> Vec<String> {
        let mut hits: Vec<String> = self
            .candidates_in(rect)
            .into_iter()
            .filter(|id| self.bounds.get(id).is_some_and(|b| b.intersects(rect)))
            .collect();
        hits.sort();
        hits
    }

    /// Ids matched by a drag-selection rectangle.
    ///
    /// With `fully_contained` the exact test requires the whole box inside
    /// the rectangle (drag-select-encloses); otherwise intersection suffices
    /// (drag-select-touches).
    pub fn query_selection_box(&self, rect: &BoundingBox, fully_contained: bool) -> Vec<String> {
        let mut hits: Vec<String> = self
            .candidates_in(rect)
            .into_iter()
            .filter(|id| {
                self.bounds.get(id).is_some_and(|b| {
                    if fully_contained {
                        rect.contains_box(b)
                    } else {
                        rect.intersects(b)
                    }
                })
            })
            .collect();
        hits.sort();
        hits
    }

    /// Up to `limit` ids within `max_distance` of the point, by centroid
    /// distance, closest first.
    ///
    /// The broad phase is a region query over a square of side
    /// `2 * max_distance` centered on the point; a closer match can only be
    /// missed if `max_distance` is not a true upper bound for the caller.
    pub fn nearest(&self, x: f64, y: f64, max_distance: f64, limit: usize) -> Vec<String> {
        let search = BoundingBox::new(
            x - max_distance,
            y - max_distance,
            2.0 * max_distance,
            2.0 * max_distance,
        );
        let mut scored: Vec<(f64, String)> = self
            .candidates_in(&search)
            .into_iter()
            .filter_map(|id| {
                let bbox = self.bounds.get(&id)?;
                let distance = bbox.center_distance_to(x, y);
                (distance <= max_distance).then_some((distance, id))
            })
            .collect();
        // Ties break by id so results are deterministic.
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(limit);
        scored.into_iter().map(|(_, id)| id).collect()
    }

    /// Components whose overlap with `id` meets the area threshold.
    ///
    /// A threshold of zero means any positive overlap; touching edges with
    /// zero area never count.
    pub fn detect_overlaps(&self, id: &str, overlap_area_threshold: f64) -> Vec<String> {
        let Some(target) = self.bounds.get(id).copied() else {
            return Vec::new();
        };
        let mut hits: Vec<String> = self
            .candidates_in(&target)
            .into_iter()
            .filter(|other| other.as_str() != id)
            .filter(|other| {
                self.bounds.get(other).is_some_and(|b| {
                    let area = target.intersection_area(b);
                    area > 0.0 && area >= overlap_area_threshold
                })
            })
            .collect();
        hits.sort();
        hits
    }

    /// Purge empty cell entries left behind by removals and moves.
    pub fn optimize(&mut self) {
        let before = self.cells.len();
        self.cells.retain(|_, ids| !ids.is_empty());
        let purged = before - self.cells.len();
        if purged > 0 {
            tracing::debug!(purged, "purged empty spatial cells");
        }
    }

    /// Current index statistics.
    pub fn statistics(&self) -> IndexStatistics {
        let cell_count = self.cells.len();
        let populations: usize = self.cells.values().map(HashSet::len).sum();
        IndexStatistics {
            component_count: self.bounds.len(),
            cell_count,
            avg_per_cell: if cell_count == 0 {
                0.0
            } else {
                populations as f64 / cell_count as f64
            },
            max_per_cell: self.cells.values().map(HashSet::len).max().unwrap_or(0),
            cell_size: self.cell_size,
        }
    }

    /// Rebuild the index from scratch out of a component table.
    pub fn rebuild<'a>(
        &mut self,
        components: impl IntoIterator<Item = (&'a str, BoundingBox)>,
    ) {
        self.clear();
        for (id, bbox) in components {
            self.insert(id.to_string(), bbox);
        }
    }

    /// Replay one state change into the index.
    ///
    /// Only `components.*` paths matter: creates and deletes of whole
    /// components add/remove entries, and any change under a component's
    /// `bounds` re-reads the new box. Everything else is ignored, so the
    /// index stays derived purely from component diffs.
    pub fn apply_change(&mut self, change: &Change) {
        let Some(rest) = change.path.strip_prefix("components.") else {
            return;
        };
        let mut parts = rest.splitn(2, '.');
        let id = match parts.next() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return,
        };
        let field = parts.next();

        match (field, change.kind) {
            // Whole-component create/delete.
            (None, ChangeKind::Create) => {
                if let Some(bbox) = change.new.as_ref().and_then(bounds_from_component) {
                    self.insert(id, bbox);
                }
            }
            (None, ChangeKind::Delete) => self.remove(&id),
            (None, ChangeKind::Update) => {
                if let Some(bbox) = change.new.as_ref().and_then(bounds_from_component) {
                    self.update(&id, bbox);
                }
            }
            // A change somewhere under the component's bounds.
            (Some(field), _) if field == "bounds" || field.starts_with("bounds.") => {
                if field == "bounds" && change.kind == ChangeKind::Delete {
                    self.remove(&id);
                    return;
                }
                if let Some(bbox) = self.patched_bounds(&id, field, change) {
                    self.update(&id, bbox);
                }
            }
            _ => {}
        }
    }

    // Apply a bounds-level or bounds-field-level change on top of the stored
    // box for the id.
    fn patched_bounds(&self, id: &str, field: &str, change: &Change) -> Option<BoundingBox> {
        if field == "bounds" {
            return change.new.as_ref().and_then(value_to_bounds);
        }
        let mut bbox = self.bounds.get(id).copied().unwrap_or_default();
        let coord = field.strip_prefix("bounds.")?;
        let v = change.new.as_ref().and_then(Value::as_f64)?;
        match coord {
            "x" => bbox.x = v,
            "y" => bbox.y = v,
            "width" => bbox.width = v.max(0.0),
            "height" => bbox.height = v.max(0.0),
            _ => return None,
        }
        Some(bbox)
    }
}

fn bounds_from_component(component: &Value) -> Option<BoundingBox> {
    value_to_bounds(component.get("bounds")?)
}

fn value_to_bounds(value: &Value) -> Option<BoundingBox> {
    serde_json::from_value(value.clone()).ok()
}
