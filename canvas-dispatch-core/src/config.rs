//! Engine configuration.

use std::time::Duration;

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of history entries kept.
    pub max_history_entries: usize,
    /// Maximum estimated history footprint in bytes.
    pub max_history_bytes: usize,
    /// Spatial grid cell size in canvas units.
    pub spatial_cell_size: f64,
    /// Reducer+pipeline latency budget; slower actions log a warning.
    pub performance_budget: Duration,
    /// Quiet period before a dirty state is snapshotted.
    pub persistence_debounce: Duration,
    /// Storage key used for automatic snapshots.
    pub autosave_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_history_entries: 100,
            max_history_bytes: 8 * 1024 * 1024,
            spatial_cell_size: 100.0,
            performance_budget: Duration::from_millis(16),
            persistence_debounce: Duration::from_millis(500),
            autosave_key: "autosave".to_string(),
        }
    }
}
