//! Middleware pipeline: ordered before/after interceptors around dispatch.
//!
//! Before-hooks run in registration order and may veto an action; a veto (or
//! an error from a hook) drops the action silently from the caller's point
//! of view, with a log record. After-hooks run in registration order once
//! the new state is committed; they are non-transactional best-effort side
//! effects and can never roll a commit back.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::action::Action;
use crate::diff::Change;
use crate::error::EngineError;
use crate::history::HistoryManager;
use crate::persist::{save_with_retry, PersistenceBackend};
use crate::state::AppState;

/// An interceptor around dispatch.
pub trait Middleware: Send {
    /// Name used in log records.
    fn name(&self) -> &'static str;

    /// Runs before the reducer. Return `Ok(None)` to veto the action;
    /// errors also veto. The returned action may be a modified copy.
    fn before(
        &mut self,
        action: &Action,
        _state: &AppState,
    ) -> Result<Option<Action>, EngineError> {
        Ok(Some(action.clone()))
    }

    /// Runs after the commit with the computed changes.
    fn after(&mut self, _action: &Action, _state: &AppState, _changes: &[Change]) {}
}

/// Ordered middleware chain.
pub struct MiddlewarePipeline {
    middlewares: Vec<Box<dyn Middleware>>,
}

impl std::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("count", &self.middlewares.len())
            .finish()
    }
}

impl Default for MiddlewarePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl MiddlewarePipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    /// Append a middleware to the chain.
    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(Box::new(middleware));
    }

    /// Run the before chain. `None` means the action was vetoed.
    pub fn run_before(&mut self, action: Action, state: &AppState) -> Option<Action> {
        let mut current = action;
        for middleware in &mut self.middlewares {
            match middleware.before(&current, state) {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    tracing::info!(
                        middleware = middleware.name(),
                        kind = %current.kind,
                        action_id = current.id,
                        "action vetoed"
                    );
                    return None;
                }
                Err(err) => {
                    tracing::warn!(
                        middleware = middleware.name(),
                        kind = %current.kind,
                        action_id = current.id,
                        error = %err,
                        "before-hook failed, action dropped"
                    );
                    return None;
                }
            }
        }
        Some(current)
    }

    /// Run the after chain. Failures are logged, never propagated.
    pub fn run_after(&mut self, action: &Action, state: &AppState, changes: &[Change]) {
        for middleware in &mut self.middlewares {
            let name = middleware.name();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                middleware.after(action, state, changes);
            }))
            .is_err()
            {
                tracing::error!(middleware = name, kind = %action.kind, "after-hook panicked");
            }
        }
    }
}

/// 1. Structural payload validation. Must run first.
#[derive(Debug, Default)]
pub struct ValidationMiddleware;

impl Middleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn before(
        &mut self,
        action: &Action,
        _state: &AppState,
    ) -> Result<Option<Action>, EngineError> {
        if !(action.payload.is_object() || action.payload.is_null()) {
            return Err(EngineError::Validation {
                kind: action.kind.clone(),
                reason: "payload must be an object or null".to_string(),
            });
        }
        // Ids become state paths; traversal markers must not sneak through.
        if let Some(id) = action.payload.get("id").and_then(Value::as_str) {
            if id.is_empty() || id.contains(['.', '/']) {
                return Err(EngineError::Validation {
                    kind: action.kind.clone(),
                    reason: format!("id {id:?} contains path characters"),
                });
            }
        }
        Ok(Some(action.clone()))
    }
}

/// 2. Latency guard. Advisory only: logs a warning, never vetoes.
///
/// The worker processes one action at a time, so a single in-flight slot
/// suffices; the next `before` naturally supersedes the timing of an action
/// whose after-chain never ran (failed reducer, unknown kind, no-op replay).
#[derive(Debug)]
pub struct PerformanceMiddleware {
    budget: Duration,
    inflight: Option<(u64, Instant)>,
}

impl PerformanceMiddleware {
    /// Create a guard with the given latency budget.
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            inflight: None,
        }
    }
}

impl Middleware for PerformanceMiddleware {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn before(
        &mut self,
        action: &Action,
        _state: &AppState,
    ) -> Result<Option<Action>, EngineError> {
        self.inflight = Some((action.id, Instant::now()));
        Ok(Some(action.clone()))
    }

    fn after(&mut self, action: &Action, _state: &AppState, _changes: &[Change]) {
        let Some((id, started)) = self.inflight.take() else {
            return;
        };
        if id != action.id {
            return;
        }
        let elapsed = started.elapsed();
        if elapsed > self.budget {
            tracing::warn!(
                kind = %action.kind,
                action_id = action.id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.budget.as_millis() as u64,
                "action exceeded performance budget"
            );
        }
    }
}

/// 3. History recording. Skips undo/redo replays so undoing an undo does not
/// pollute the timeline.
#[derive(Debug)]
pub struct HistoryMiddleware {
    history: Arc<Mutex<HistoryManager>>,
}

impl HistoryMiddleware {
    /// Record into the shared timeline.
    pub fn new(history: Arc<Mutex<HistoryManager>>) -> Self {
        Self { history }
    }
}

impl Middleware for HistoryMiddleware {
    fn name(&self) -> &'static str {
        "history"
    }

    fn after(&mut self, action: &Action, _state: &AppState, changes: &[Change]) {
        if action.is_history_replay() || changes.is_empty() {
            return;
        }
        if let Ok(mut history) = self.history.lock() {
            history.record(action, changes.to_vec());
        }
    }
}

/// 4. Structured audit logging: one record per processed action.
#[derive(Debug)]
pub struct AuditMiddleware {
    /// How many distinct path prefixes to include per record.
    max_prefixes: usize,
}

impl AuditMiddleware {
    /// Log up to `max_prefixes` affected top-level paths per action.
    pub fn new(max_prefixes: usize) -> Self {
        Self { max_prefixes }
    }
}

impl Middleware for AuditMiddleware {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn after(&mut self, action: &Action, _state: &AppState, changes: &[Change]) {
        let prefixes = leading_prefixes(changes, self.max_prefixes);

        tracing::info!(
            kind = %action.kind,
            action_id = action.id,
            change_count = changes.len(),
            paths = ?prefixes,
            "action processed"
        );
    }
}

/// The first `max` distinct top-level path prefixes, in the order the
/// changes touched them.
fn leading_prefixes(changes: &[Change], max: usize) -> Vec<&str> {
    let mut prefixes: Vec<&str> = Vec::new();
    for change in changes {
        let prefix = change.path.split('.').next().unwrap_or("");
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
            if prefixes.len() == max {
                break;
            }
        }
    }
    prefixes
}

/// 5. Persistence scheduling: marks the state dirty and debounces a snapshot
/// write off the dispatch path.
pub struct PersistenceMiddleware {
    backend: Arc<dyn PersistenceBackend>,
    key: String,
    debounce: Duration,
    state_rx: watch::Receiver<Arc<AppState>>,
    pending: Option<AbortHandle>,
}

impl std::fmt::Debug for PersistenceMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMiddleware")
            .field("key", &self.key)
            .field("debounce", &self.debounce)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl PersistenceMiddleware {
    /// Schedule snapshots of the committed state into `backend` under `key`.
    pub fn new(
        backend: Arc<dyn PersistenceBackend>,
        key: impl Into<String>,
        debounce: Duration,
        state_rx: watch::Receiver<Arc<AppState>>,
    ) -> Self {
        Self {
            backend,
            key: key.into(),
            debounce,
            state_rx,
            pending: None,
        }
    }
}

impl Middleware for PersistenceMiddleware {
    fn name(&self) -> &'static str {
        "persistence"
    }

    fn after(&mut self, _action: &Action, _state: &AppState, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }
        // New edits reset the debounce timer: cancel the pending write and
        // schedule a fresh one.
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }

        let backend = Arc::clone(&self.backend);
        let key = self.key.clone();
        let debounce = self.debounce;
        let state_rx = self.state_rx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // Read the latest committed state at fire time, not schedule time.
            let state = Arc::clone(&*state_rx.borrow());
            let blob = match state.to_value() {
                Ok(blob) => blob,
                Err(err) => {
                    tracing::error!(key, error = %err, "snapshot serialization failed");
                    return;
                }
            };
            if let Err(err) = save_with_retry(backend.as_ref(), &key, &blob, 3).await {
                tracing::error!(key, error = %err, "snapshot write gave up");
            }
        });
        self.pending = Some(handle.abort_handle());
    }
}

impl Drop for PersistenceMiddleware {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ChangeKind;
    use serde_json::json;

    struct Veto;
    impl Middleware for Veto {
        fn name(&self) -> &'static str {
            "veto"
        }
        fn before(
            &mut self,
            _action: &Action,
            _state: &AppState,
        ) -> Result<Option<Action>, EngineError> {
            Ok(None)
        }
    }

    struct Tag;
    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            "tag"
        }
        fn before(
            &mut self,
            action: &Action,
            _state: &AppState,
        ) -> Result<Option<Action>, EngineError> {
            Ok(Some(action.clone().with_batch("tagged")))
        }
    }

    fn change(path: &str) -> Change {
        Change {
            path: path.to_string(),
            kind: ChangeKind::Update,
            old: Some(json!(1)),
            new: Some(json!(2)),
        }
    }

    #[test]
    fn test_veto_stops_chain() {
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Veto);
        pipeline.add(Tag);
        let state = AppState::default();
        let action = Action::new("component/add", json!({"id": "c1"}));
        assert!(pipeline.run_before(action, &state).is_none());
    }

    #[test]
    fn test_before_hooks_thread_the_action() {
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Tag);
        let state = AppState::default();
        let action = Action::new("component/add", json!({"id": "c1"}));
        let out = pipeline.run_before(action, &state).unwrap();
        assert_eq!(out.batch.as_deref(), Some("tagged"));
    }

    #[test]
    fn test_validation_rejects_non_object_payload() {
        let mut mw = ValidationMiddleware;
        let state = AppState::default();
        let bad = Action::new("component/add", json!("not an object"));
        assert!(mw.before(&bad, &state).is_err());

        let null = Action::new("selection/clear", Value::Null);
        assert!(mw.before(&null, &state).unwrap().is_some());
    }

    #[test]
    fn test_validation_rejects_traversal_ids() {
        let mut mw = ValidationMiddleware;
        let state = AppState::default();
        let bad = Action::new("component/add", json!({"id": "../../etc"}));
        assert!(mw.before(&bad, &state).is_err());
        let bad = Action::new("component/add", json!({"id": "a.b"}));
        assert!(mw.before(&bad, &state).is_err());
        let ok = Action::new("component/add", json!({"id": "c1"}));
        assert!(mw.before(&ok, &state).unwrap().is_some());
    }

    #[test]
    fn test_performance_guard_holds_one_timing_at_a_time() {
        let mut mw = PerformanceMiddleware::new(Duration::from_secs(1));
        let state = AppState::default();
        let failed = Action::new("component/add", json!({ "id": "dup" }));
        let next = Action::new("theme/set", json!({ "name": "dark" }));

        // An action whose after-chain never ran (rejected reducer, unknown
        // kind) leaves no residue; the next action supersedes its slot.
        mw.before(&failed, &state).unwrap();
        mw.before(&next, &state).unwrap();
        assert_eq!(mw.inflight.map(|(id, _)| id), Some(next.id));

        mw.after(&next, &state, &[change("theme")]);
        assert!(mw.inflight.is_none());

        // An after for an action that was never timed is ignored.
        mw.after(&failed, &state, &[]);
        assert!(mw.inflight.is_none());
    }

    #[test]
    fn test_panicking_after_hook_is_contained() {
        struct Panics;
        impl Middleware for Panics {
            fn name(&self) -> &'static str {
                "panics"
            }
            fn after(&mut self, _: &Action, _: &AppState, _: &[Change]) {
                panic!("boom");
            }
        }

        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Panics);
        let state = AppState::default();
        let action = Action::new("theme/set", json!({"name": "dark"}));
        // Must not unwind into the dispatch worker.
        pipeline.run_after(&action, &state, &[change("theme")]);
    }

    #[test]
    fn test_audit_prefixes_in_encounter_order() {
        let changes = [
            change("selection.0"),
            change("components.c1.bounds.x"),
            change("selection.1"),
            change("canvas.zoom"),
        ];
        // Encounter order, deduped, then capped.
        assert_eq!(
            leading_prefixes(&changes, 5),
            vec!["selection", "components", "canvas"]
        );
        assert_eq!(leading_prefixes(&changes, 2), vec!["selection", "components"]);
        assert!(leading_prefixes(&[], 5).is_empty());
    }

    #[test]
    fn test_history_middleware_skips_replays() {
        let history = Arc::new(Mutex::new(HistoryManager::new(10, usize::MAX)));
        let mut mw = HistoryMiddleware::new(Arc::clone(&history));
        let state = AppState::default();

        let replay = Action::new(crate::action::kinds::HISTORY_UNDO, Value::Null);
        mw.after(&replay, &state, &[change("theme")]);
        assert!(history.lock().unwrap().is_empty());

        let edit = Action::new("theme/set", json!({"name": "dark"}));
        mw.after(&edit, &state, &[change("theme")]);
        assert_eq!(history.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_middleware_debounces() {
        use crate::persist::MemoryBackend;

        let backend = Arc::new(MemoryBackend::new());
        let (state_tx, state_rx) = watch::channel(Arc::new(AppState::default()));
        let mut mw = PersistenceMiddleware::new(
            Arc::clone(&backend) as Arc<dyn PersistenceBackend>,
            "autosave",
            Duration::from_millis(20),
            state_rx,
        );

        let state = AppState::default();
        let action = Action::new("theme/set", json!({"name": "dark"}));

        // Two rapid commits: only one write should land.
        mw.after(&action, &state, &[change("theme")]);
        mw.after(&action, &state, &[change("theme")]);

        let mut themed = AppState::default();
        themed.theme = "dark".to_string();
        state_tx.send(Arc::new(themed)).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let saved = backend.load("autosave").unwrap().expect("snapshot saved");
        assert_eq!(saved.get("theme"), Some(&json!("dark")));
    }
}
