//! Error taxonomy for the engine.

use thiserror::Error;

/// Errors surfaced by the engine's public API and internal pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The action failed structural validation before it was enqueued.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// A state path contained traversal markers or empty segments.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No reducer is registered for the action kind.
    #[error("no reducer registered for action kind {0:?}")]
    UnknownAction(String),

    /// A middleware rejected the action payload.
    #[error("validation failed for {kind:?}: {reason}")]
    Validation {
        /// Action kind under validation.
        kind: String,
        /// Why validation failed.
        reason: String,
    },

    /// The action queue is no longer accepting work (engine shutting down).
    #[error("engine is shutting down, action rejected")]
    Concurrency,

    /// A persistence operation failed. Non-fatal: durability is affected,
    /// in-memory state is not.
    #[error("persistence failed for key {key:?}: {reason}")]
    Persistence {
        /// Storage key.
        key: String,
        /// Underlying failure.
        reason: String,
    },

    /// The spatial index was asked to update an id it has no bounds for.
    /// Recovered by treating the update as an insert.
    #[error("spatial index has no entry for component {0:?}")]
    IndexConsistency(String),

    /// `start_batch` was called while another batch was open.
    #[error("history batch {0:?} is already active")]
    BatchAlreadyActive(String),

    /// `end_batch` was called with no matching open batch.
    #[error("no active history batch matches {0:?}")]
    BatchNotActive(String),

    /// State snapshot (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Shorthand for a persistence failure.
    pub fn persistence(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Persistence {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an invalid-path failure.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
