//! Application state tree.
//!
//! `AppState` is the single source of truth. It is owned by the dispatch
//! worker and replaced wholesale on every commit; readers only ever see a
//! fully formed snapshot behind an `Arc`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bounds::BoundingBox;
use crate::error::EngineError;

/// One visual component on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    /// Stable component id.
    pub id: String,
    /// Component kind, e.g. `"button"` or `"text"`.
    pub kind: String,
    /// Display name shown in layer panels.
    pub name: String,
    /// Position and size on the canvas.
    pub bounds: BoundingBox,
    /// Stacking order, higher draws on top.
    pub z_index: i32,
    /// Whether the component is rendered at all.
    pub visible: bool,
    /// Kind-specific properties (fill, text content, ...).
    pub props: Value,
}

impl ComponentState {
    /// Create a component with defaults for everything but id and bounds.
    pub fn new(id: impl Into<String>, bounds: BoundingBox) -> Self {
        Self {
            id: id.into(),
            kind: "frame".to_string(),
            name: String::new(),
            bounds,
            z_index: 0,
            visible: true,
            props: Value::Null,
        }
    }
}

/// Window settings of the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    /// Window width in pixels.
    pub width: u32,
    /// Window height in pixels.
    pub height: u32,
    /// Window title.
    pub title: String,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
            title: "Untitled".to_string(),
        }
    }
}

/// Project metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    /// Project name.
    pub name: String,
    /// Free-form project description.
    pub description: String,
}

/// Canvas viewport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasState {
    /// Zoom factor, 1.0 = 100%.
    pub zoom: f64,
    /// Horizontal pan offset.
    pub offset_x: f64,
    /// Vertical pan offset.
    pub offset_y: f64,
    /// Whether the alignment grid is drawn.
    pub grid_visible: bool,
}

impl Default for CanvasState {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            grid_visible: true,
        }
    }
}

/// Root state aggregate.
///
/// Components live in a `BTreeMap` so snapshot serialization is stable,
/// which keeps diff output deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    /// Host window settings.
    pub window: WindowState,
    /// Active theme name.
    pub theme: String,
    /// Project metadata.
    pub project: ProjectState,
    /// All components, keyed by id.
    pub components: BTreeMap<String, ComponentState>,
    /// Ids of currently selected components.
    pub selection: Vec<String>,
    /// Canvas viewport.
    pub canvas: CanvasState,
}

impl AppState {
    /// Serialize the state to a JSON tree for diffing and persistence.
    pub fn to_value(&self) -> Result<Value, EngineError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a typed state from a JSON tree.
    pub fn from_value(value: Value) -> Result<Self, EngineError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Navigate a dot-separated path through a JSON tree.
///
/// Returns `None` for absent keys or out-of-range indices. The empty path
/// addresses the whole tree. Paths with empty segments (which also covers a
/// leading separator) or `..` traversal markers are rejected.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Result<Option<&'a Value>, EngineError> {
    if path.is_empty() {
        return Ok(Some(root));
    }
    validate_path(path)?;

    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Ok(None),
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
    }
    Ok(Some(current))
}

/// Reject paths containing traversal markers or empty segments.
pub fn validate_path(path: &str) -> Result<(), EngineError> {
    if path.contains("..") {
        return Err(EngineError::invalid_path(path, "traversal marker"));
    }
    if path.split('.').any(str::is_empty) {
        return Err(EngineError::invalid_path(
            path,
            "empty segment or leading separator",
        ));
    }
    Ok(())
}
