//! Core types and engine for canvas-dispatch
//!
//! This crate provides the state-management core for canvas-based design
//! tools: a controlled, action-driven store with middleware, an undo/redo
//! history manager, and a grid-based spatial index for hit-testing over
//! visual components.
//!
//! # Core Concepts
//!
//! - **Action**: a description of an intended mutation, consumed exactly once
//! - **Engine**: single-writer store; all mutation flows through `dispatch`
//! - **Change**: one leaf-level difference between two committed snapshots
//! - **HistoryManager**: linear undo/redo timeline with batching
//! - **SpatialIndex**: uniform hash grid answering hit-test queries
//!
//! # Basic Example
//!
//! ```ignore
//! use canvas_dispatch_core::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::builder().build();
//!
//!     engine
//!         .dispatch(Action::new(
//!             kinds::ADD_COMPONENT,
//!             json!({
//!                 "id": "hero",
//!                 "kind": "frame",
//!                 "bounds": { "x": 0.0, "y": 0.0, "width": 400.0, "height": 300.0 },
//!             }),
//!         ))
//!         .unwrap();
//!     engine.settle().await;
//!
//!     assert_eq!(engine.query_point(10.0, 10.0), vec!["hero"]);
//!     engine.undo().unwrap();
//!     engine.settle().await;
//!     assert!(engine.query_point(10.0, 10.0).is_empty());
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! # Concurrency model
//!
//! Any number of producers may `dispatch` concurrently; exactly one worker
//! task applies actions, so write-write races are impossible by
//! construction. Readers get the committed snapshot through a watch channel
//! and never observe a partially built state. Persistence I/O is offloaded
//! and fire-and-forget; failures there cost durability, never correctness.

pub mod action;
pub mod bounds;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod history;
pub mod middleware;
pub mod persist;
pub mod reducers;
pub mod spatial;
pub mod state;
pub mod subscription;

// Core exports
pub use action::{kinds, Action};
pub use bounds::BoundingBox;
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;

// Diff exports
pub use diff::{apply, diff, invert, Change, ChangeKind};

// History exports
pub use history::{HistoryEntry, HistoryManager, TimelineItem};

// Middleware exports
pub use middleware::{
    AuditMiddleware, HistoryMiddleware, Middleware, MiddlewarePipeline, PerformanceMiddleware,
    PersistenceMiddleware, ValidationMiddleware,
};

// Persistence exports
pub use persist::{FileBackend, MemoryBackend, PersistenceBackend};

// Spatial exports
pub use spatial::{IndexStatistics, SpatialIndex};

// State exports
pub use state::{
    resolve_path, validate_path, AppState, CanvasState, ComponentState, ProjectState, WindowState,
};

// Subscription exports
pub use subscription::{SubscriberCallback, SubscriberFilter, Subscription};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::action::{kinds, Action};
    pub use crate::bounds::BoundingBox;
    pub use crate::config::EngineConfig;
    pub use crate::diff::{Change, ChangeKind};
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::error::EngineError;
    pub use crate::history::TimelineItem;
    pub use crate::middleware::{Middleware, MiddlewarePipeline};
    pub use crate::persist::{FileBackend, MemoryBackend, PersistenceBackend};
    pub use crate::spatial::{IndexStatistics, SpatialIndex};
    pub use crate::state::{AppState, ComponentState};
    pub use crate::subscription::{SubscriberCallback, SubscriberFilter, Subscription};
}
