//! Built-in reducers for the standard action kinds.
//!
//! A reducer receives the current state and an action and produces a new
//! state; it never mutates in place. The engine looks reducers up in a table
//! keyed by action kind, so applications extend behavior by registering
//! additional kinds rather than editing a central match.

use serde_json::Value;

use crate::action::{kinds, Action};
use crate::bounds::BoundingBox;
use crate::error::EngineError;
use crate::state::{AppState, ComponentState};

/// Reducer signature: pure state transition, copy-on-write.
pub type ReducerFn =
    Box<dyn Fn(&AppState, &Action) -> Result<AppState, EngineError> + Send + Sync>;

/// Register the built-in reducers into a lookup table.
pub fn builtin_reducers() -> Vec<(&'static str, ReducerFn)> {
    vec![
        (kinds::ADD_COMPONENT, Box::new(add_component)),
        (kinds::UPDATE_COMPONENT, Box::new(update_component)),
        (kinds::REMOVE_COMPONENT, Box::new(remove_component)),
        (kinds::SET_SELECTION, Box::new(set_selection)),
        (kinds::CLEAR_SELECTION, Box::new(clear_selection)),
        (kinds::UPDATE_CANVAS, Box::new(update_canvas)),
        (kinds::SET_THEME, Box::new(set_theme)),
        (kinds::UPDATE_PROJECT, Box::new(update_project)),
        (kinds::UPDATE_WINDOW, Box::new(update_window)),
    ]
}

fn validation(kind: &str, reason: impl Into<String>) -> EngineError {
    EngineError::Validation {
        kind: kind.to_string(),
        reason: reason.into(),
    }
}

fn required_id(action: &Action) -> Result<String, EngineError> {
    action
        .payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| validation(&action.kind, "payload requires a string \"id\""))
}

fn add_component(state: &AppState, action: &Action) -> Result<AppState, EngineError> {
    let id = required_id(action)?;
    if state.components.contains_key(&id) {
        return Err(validation(&action.kind, format!("component {id:?} exists")));
    }
    let bounds: BoundingBox = action
        .payload
        .get("bounds")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .ok_or_else(|| validation(&action.kind, "payload requires \"bounds\""))?;

    let mut component = ComponentState::new(id.clone(), bounds);
    if let Some(kind) = action.payload.get("kind").and_then(Value::as_str) {
        component.kind = kind.to_string();
    }
    if let Some(name) = action.payload.get("name").and_then(Value::as_str) {
        component.name = name.to_string();
    }
    if let Some(z) = action.payload.get("z_index").and_then(Value::as_i64) {
        component.z_index = z as i32;
    }
    if let Some(props) = action.payload.get("props") {
        component.props = props.clone();
    }

    let mut next = state.clone();
    next.components.insert(id, component);
    Ok(next)
}

fn update_component(state: &AppState, action: &Action) -> Result<AppState, EngineError> {
    let id = required_id(action)?;
    let mut next = state.clone();
    let component = next
        .components
        .get_mut(&id)
        .ok_or_else(|| validation(&action.kind, format!("unknown component {id:?}")))?;

    if let Some(bounds) = action.payload.get("bounds") {
        component.bounds = serde_json::from_value(bounds.clone())?;
    }
    if let Some(kind) = action.payload.get("kind").and_then(Value::as_str) {
        component.kind = kind.to_string();
    }
    if let Some(name) = action.payload.get("name").and_then(Value::as_str) {
        component.name = name.to_string();
    }
    if let Some(z) = action.payload.get("z_index").and_then(Value::as_i64) {
        component.z_index = z as i32;
    }
    if let Some(visible) = action.payload.get("visible").and_then(Value::as_bool) {
        component.visible = visible;
    }
    if let Some(props) = action.payload.get("props") {
        component.props = props.clone();
    }
    Ok(next)
}

fn remove_component(state: &AppState, action: &Action) -> Result<AppState, EngineError> {
    let id = required_id(action)?;
    let mut next = state.clone();
    if next.components.remove(&id).is_none() {
        return Err(validation(&action.kind, format!("unknown component {id:?}")));
    }
    next.selection.retain(|s| s != &id);
    Ok(next)
}

fn set_selection(state: &AppState, action: &Action) -> Result<AppState, EngineError> {
    let ids: Vec<String> = action
        .payload
        .get("ids")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .ok_or_else(|| validation(&action.kind, "payload requires \"ids\""))?;

    for id in &ids {
        if !state.components.contains_key(id) {
            return Err(validation(&action.kind, format!("unknown component {id:?}")));
        }
    }
    let mut next = state.clone();
    next.selection = ids;
    Ok(next)
}

fn clear_selection(state: &AppState, _action: &Action) -> Result<AppState, EngineError> {
    let mut next = state.clone();
    next.selection.clear();
    Ok(next)
}

fn update_canvas(state: &AppState, action: &Action) -> Result<AppState, EngineError> {
    let mut next = state.clone();
    if let Some(zoom) = action.payload.get("zoom").and_then(Value::as_f64) {
        if zoom <= 0.0 {
            return Err(validation(&action.kind, "zoom must be positive"));
        }
        next.canvas.zoom = zoom;
    }
    if let Some(x) = action.payload.get("offset_x").and_then(Value::as_f64) {
        next.canvas.offset_x = x;
    }
    if let Some(y) = action.payload.get("offset_y").and_then(Value::as_f64) {
        next.canvas.offset_y = y;
    }
    if let Some(grid) = action.payload.get("grid_visible").and_then(Value::as_bool) {
        next.canvas.grid_visible = grid;
    }
    Ok(next)
}

fn set_theme(state: &AppState, action: &Action) -> Result<AppState, EngineError> {
    let name = action
        .payload
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| validation(&action.kind, "payload requires \"name\""))?;
    let mut next = state.clone();
    next.theme = name.to_string();
    Ok(next)
}

fn update_project(state: &AppState, action: &Action) -> Result<AppState, EngineError> {
    let mut next = state.clone();
    if let Some(name) = action.payload.get("name").and_then(Value::as_str) {
        next.project.name = name.to_string();
    }
    if let Some(description) = action.payload.get("description").and_then(Value::as_str) {
        next.project.description = description.to_string();
    }
    Ok(next)
}

fn update_window(state: &AppState, action: &Action) -> Result<AppState, EngineError> {
    let mut next = state.clone();
    if let Some(width) = action.payload.get("width").and_then(Value::as_u64) {
        next.window.width = width as u32;
    }
    if let Some(height) = action.payload.get("height").and_then(Value::as_u64) {
        next.window.height = height as u32;
    }
    if let Some(title) = action.payload.get("title").and_then(Value::as_str) {
        next.window.title = title.to_string();
    }
    Ok(next)
}
