//! canvas-dispatch: Centralized state management for canvas-based design tools
//!
//! Like Redux, but for design canvases: all state mutations happen through
//! dispatched actions processed by a single worker, every edit is undoable,
//! and a grid-based spatial index answers hit-test queries over thousands of
//! components.
//!
//! # Example
//! ```ignore
//! use canvas_dispatch::prelude::*;
//! use serde_json::json;
//!
//! let engine = Engine::builder().build();
//! engine.dispatch(Action::new(
//!     kinds::ADD_COMPONENT,
//!     json!({
//!         "id": "card",
//!         "bounds": { "x": 20.0, "y": 20.0, "width": 200.0, "height": 120.0 },
//!     }),
//! ))?;
//! ```

// Re-export everything from core
pub use canvas_dispatch_core::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use canvas_dispatch_core::prelude::*;
}
