//! The engine: single-writer dispatch worker plus the public API surface.
//!
//! Producers on any task call [`Engine::dispatch`]; one spawned worker pulls
//! actions off an unbounded queue, runs them through the middleware
//! pipeline and reducer table, and publishes the new state through a watch
//! channel. Readers always observe a fully formed pre- or post-image because
//! the committed `Arc<AppState>` is swapped only after the new state is
//! completely built.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::{kinds, Action};
use crate::bounds::BoundingBox;
use crate::config::EngineConfig;
use crate::diff::{self, Change};
use crate::error::EngineError;
use crate::history::{HistoryManager, TimelineItem};
use crate::middleware::{
    AuditMiddleware, HistoryMiddleware, MiddlewarePipeline, PerformanceMiddleware,
    PersistenceMiddleware, ValidationMiddleware,
};
use crate::persist::{save_with_retry, PersistenceBackend};
use crate::reducers::{builtin_reducers, ReducerFn};
use crate::spatial::{IndexStatistics, SpatialIndex};
use crate::state::{resolve_path, AppState};
use crate::subscription::{self, SubscriberCallback, SubscriberFilter, Subscription};

/// Queue traffic between the engine handles and the worker.
enum WorkerMessage {
    /// A dispatched action.
    Action(Action),
    /// Settle marker: dropped once everything enqueued before it ran.
    Settle(tokio::sync::oneshot::Sender<()>),
}

/// Builder for [`Engine`] instances.
///
/// Engines are explicitly constructed and passed around; there is no global
/// instance, so tests build isolated engines freely.
pub struct EngineBuilder {
    config: EngineConfig,
    initial: AppState,
    reducers: HashMap<String, ReducerFn>,
    backend: Option<Arc<dyn PersistenceBackend>>,
    restore: bool,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("reducers", &self.reducers.len())
            .field("has_backend", &self.backend.is_some())
            .field("restore", &self.restore)
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Start from defaults with the built-in reducers registered.
    pub fn new() -> Self {
        let mut reducers = HashMap::new();
        for (kind, reducer) in builtin_reducers() {
            reducers.insert(kind.to_string(), reducer);
        }
        Self {
            config: EngineConfig::default(),
            initial: AppState::default(),
            reducers,
            backend: None,
            restore: false,
        }
    }

    /// Override the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from a specific state instead of the default.
    pub fn initial_state(mut self, state: AppState) -> Self {
        self.initial = state;
        self
    }

    /// Register (or replace) a reducer for an action kind.
    pub fn reducer<F>(mut self, kind: impl Into<String>, reducer: F) -> Self
    where
        F: Fn(&AppState, &Action) -> Result<AppState, EngineError> + Send + Sync + 'static,
    {
        self.reducers.insert(kind.into(), Box::new(reducer));
        self
    }

    /// Attach a persistence backend for snapshots and the shutdown flush.
    pub fn backend(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Restore the initial state from the backend's autosave key, falling
    /// back to the configured initial state when nothing is stored.
    pub fn restore(mut self) -> Self {
        self.restore = true;
        self
    }

    /// Build the engine and spawn its dispatch worker.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self) -> Engine {
        let mut initial = self.initial;
        if self.restore {
            if let Some(backend) = &self.backend {
                match backend
                    .load(&self.config.autosave_key)
                    .and_then(|blob| blob.map(AppState::from_value).transpose())
                {
                    Ok(Some(state)) => {
                        info!(key = %self.config.autosave_key, "state restored from snapshot");
                        initial = state;
                    }
                    Ok(None) => debug!("no snapshot to restore, starting fresh"),
                    Err(err) => warn!(error = %err, "snapshot restore failed, starting fresh"),
                }
            }
        }

        let history = Arc::new(Mutex::new(HistoryManager::new(
            self.config.max_history_entries,
            self.config.max_history_bytes,
        )));
        let mut index = SpatialIndex::new(self.config.spatial_cell_size);
        index.rebuild(
            initial
                .components
                .iter()
                .map(|(id, c)| (id.as_str(), c.bounds)),
        );
        let spatial = Arc::new(Mutex::new(index));
        let subscribers = crate::subscription::SubscriberRegistry::shared();

        let committed = Arc::new(initial);
        let (state_tx, state_rx) = watch::channel(Arc::clone(&committed));
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(ValidationMiddleware);
        pipeline.add(PerformanceMiddleware::new(self.config.performance_budget));
        pipeline.add(HistoryMiddleware::new(Arc::clone(&history)));
        pipeline.add(AuditMiddleware::new(5));
        if let Some(backend) = &self.backend {
            pipeline.add(PersistenceMiddleware::new(
                Arc::clone(backend),
                self.config.autosave_key.clone(),
                self.config.persistence_debounce,
                state_rx.clone(),
            ));
        }

        let worker = DispatchWorker {
            reducers: self.reducers,
            pipeline,
            committed_value: state_value_or_empty(&committed),
            committed: Arc::clone(&committed),
            state_tx,
            history: Arc::clone(&history),
            spatial: Arc::clone(&spatial),
            subscribers: Arc::clone(&subscribers),
            action_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Engine {
            action_tx,
            state_rx,
            history,
            spatial,
            subscribers,
            cancel,
            worker: Mutex::new(Some(handle)),
            accepting: AtomicBool::new(true),
            open_batch: Mutex::new(None),
            backend: self.backend,
            autosave_key: self.config.autosave_key,
        }
    }
}

fn state_value_or_empty(state: &AppState) -> Value {
    state.to_value().unwrap_or(Value::Null)
}

/// The state engine.
///
/// Cheap to share behind an `Arc`; every handle sees the same committed
/// state, history and index.
pub struct Engine {
    action_tx: mpsc::UnboundedSender<WorkerMessage>,
    state_rx: watch::Receiver<Arc<AppState>>,
    history: Arc<Mutex<HistoryManager>>,
    spatial: Arc<Mutex<SpatialIndex>>,
    subscribers: Arc<Mutex<crate::subscription::SubscriberRegistry>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
    open_batch: Mutex<Option<String>>,
    backend: Option<Arc<dyn PersistenceBackend>>,
    autosave_key: String,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .finish()
    }
}

impl Engine {
    /// Start building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Validate an action's shape and enqueue it.
    ///
    /// Returns without waiting for processing. Fails with `InvalidAction`
    /// on malformed input and `Concurrency` once shutdown has begun.
    pub fn dispatch(&self, action: Action) -> Result<(), EngineError> {
        if action.kind.trim().is_empty() {
            return Err(EngineError::InvalidAction("empty kind".to_string()));
        }
        if action.kind.contains("..") || action.kind.starts_with('/') {
            return Err(EngineError::InvalidAction(format!(
                "kind {:?} contains traversal markers",
                action.kind
            )));
        }
        if !(action.payload.is_object() || action.payload.is_null()) {
            return Err(EngineError::InvalidAction(
                "payload must be an object or null".to_string(),
            ));
        }
        self.enqueue(action)
    }

    fn enqueue(&self, action: Action) -> Result<(), EngineError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::Concurrency);
        }
        self.action_tx
            .send(WorkerMessage::Action(action))
            .map_err(|_| EngineError::Concurrency)
    }

    /// The committed state snapshot.
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state_rx.borrow())
    }

    /// A watch receiver that yields each committed snapshot.
    pub fn watch_state(&self) -> watch::Receiver<Arc<AppState>> {
        self.state_rx.clone()
    }

    /// Navigate a dot-separated path through the committed state.
    ///
    /// Returns `None` for absent paths; rejects traversal markers.
    pub fn get_state(&self, path: &str) -> Result<Option<Value>, EngineError> {
        let value = self.state().to_value()?;
        Ok(resolve_path(&value, path)?.cloned())
    }

    /// Register a subscriber at a path, with an optional change filter.
    pub fn subscribe(
        &self,
        path: impl Into<String>,
        callback: SubscriberCallback,
        filter: Option<SubscriberFilter>,
    ) -> Subscription {
        subscription::register(&self.subscribers, path, callback, filter)
    }

    /// Enqueue an undo replay. The actual state change happens on the
    /// worker, preserving the single-writer invariant.
    pub fn undo(&self) -> Result<(), EngineError> {
        self.enqueue(Action::new(kinds::HISTORY_UNDO, Value::Null))
    }

    /// Enqueue a redo replay.
    pub fn redo(&self) -> Result<(), EngineError> {
        self.enqueue(Action::new(kinds::HISTORY_REDO, Value::Null))
    }

    /// Whether an undo step is currently available.
    pub fn can_undo(&self) -> bool {
        self.history.lock().map(|h| h.can_undo()).unwrap_or(false)
    }

    /// Whether a redo step is currently available.
    pub fn can_redo(&self) -> bool {
        self.history.lock().map(|h| h.can_redo()).unwrap_or(false)
    }

    /// A window of the history timeline for UI display.
    pub fn get_history_timeline(&self, start: usize, limit: usize) -> Vec<TimelineItem> {
        self.history
            .lock()
            .map(|h| h.timeline(start, limit))
            .unwrap_or_default()
    }

    /// Open a recording batch: subsequent actions coalesce into one undo
    /// step tagged `id`. Only one batch may be open at a time.
    pub fn start_batch(&self, id: impl Into<String>) -> Result<(), EngineError> {
        let id = id.into();
        let mut open = self
            .open_batch
            .lock()
            .map_err(|_| EngineError::Concurrency)?;
        if let Some(active) = open.as_ref() {
            return Err(EngineError::BatchAlreadyActive(active.clone()));
        }
        // The control action rides the queue so ordering relative to the
        // batched actions is exact on the worker.
        self.enqueue(Action::new(
            kinds::HISTORY_BATCH_START,
            serde_json::json!({ "id": id }),
        ))?;
        *open = Some(id);
        Ok(())
    }

    /// Close the batch with the given id, committing the coalesced entry.
    pub fn end_batch(&self, id: &str) -> Result<(), EngineError> {
        let mut open = self
            .open_batch
            .lock()
            .map_err(|_| EngineError::Concurrency)?;
        match open.as_deref() {
            Some(active) if active == id => {}
            _ => return Err(EngineError::BatchNotActive(id.to_string())),
        }
        self.enqueue(Action::new(
            kinds::HISTORY_BATCH_END,
            serde_json::json!({ "id": id }),
        ))?;
        *open = None;
        Ok(())
    }

    /// Ids whose boxes contain the point.
    pub fn query_point(&self, x: f64, y: f64) -> Vec<String> {
        self.spatial
            .lock()
            .map(|s| s.query_point(x, y))
            .unwrap_or_default()
    }

    /// Ids whose boxes intersect the rectangle.
    pub fn query_region(&self, rect: &BoundingBox) -> Vec<String> {
        self.spatial
            .lock()
            .map(|s| s.query_region(rect))
            .unwrap_or_default()
    }

    /// Ids matched by a drag-selection rectangle.
    pub fn query_selection_box(&self, rect: &BoundingBox, fully_contained: bool) -> Vec<String> {
        self.spatial
            .lock()
            .map(|s| s.query_selection_box(rect, fully_contained))
            .unwrap_or_default()
    }

    /// Up to `limit` ids within `max_distance` of the point, closest first.
    pub fn nearest(&self, x: f64, y: f64, max_distance: f64, limit: usize) -> Vec<String> {
        self.spatial
            .lock()
            .map(|s| s.nearest(x, y, max_distance, limit))
            .unwrap_or_default()
    }

    /// Components overlapping `id` by at least the threshold area.
    pub fn detect_overlaps(&self, id: &str, overlap_area_threshold: f64) -> Vec<String> {
        self.spatial
            .lock()
            .map(|s| s.detect_overlaps(id, overlap_area_threshold))
            .unwrap_or_default()
    }

    /// Spatial index statistics for cell-size tuning.
    pub fn index_statistics(&self) -> Option<IndexStatistics> {
        self.spatial.lock().map(|s| s.statistics()).ok()
    }

    /// Purge empty cells from the spatial index.
    pub fn optimize_index(&self) {
        if let Ok(mut spatial) = self.spatial.lock() {
            spatial.optimize();
        }
    }

    /// Wait until every action enqueued so far has been processed.
    ///
    /// Useful in tests and before reading state that must reflect a prior
    /// dispatch.
    pub async fn settle(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.action_tx.send(WorkerMessage::Settle(tx)).is_err() {
            return;
        }
        // Error just means the worker is gone, which is settled enough.
        let _ = rx.await;
    }

    /// Stop accepting work, drain the queue, flush one final snapshot and
    /// join the worker.
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            self.cancel.cancel();
        }
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "dispatch worker join failed");
            }
        }
        if let Some(backend) = &self.backend {
            let blob = match self.state().to_value() {
                Ok(blob) => blob,
                Err(err) => {
                    error!(error = %err, "final snapshot serialization failed");
                    return;
                }
            };
            match save_with_retry(backend.as_ref(), &self.autosave_key, &blob, 3).await {
                Ok(()) => info!(key = %self.autosave_key, "final snapshot flushed"),
                Err(err) => error!(error = %err, "final snapshot flush failed"),
            }
        }
    }
}

struct DispatchWorker {
    reducers: HashMap<String, ReducerFn>,
    pipeline: MiddlewarePipeline,
    committed: Arc<AppState>,
    committed_value: Value,
    state_tx: watch::Sender<Arc<AppState>>,
    history: Arc<Mutex<HistoryManager>>,
    spatial: Arc<Mutex<SpatialIndex>>,
    subscribers: Arc<Mutex<crate::subscription::SubscriberRegistry>>,
    action_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    cancel: CancellationToken,
}

impl DispatchWorker {
    async fn run(mut self) {
        debug!("dispatch worker started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Close first so a send racing the drain fails back to
                    // the caller as `Concurrency` rather than landing in a
                    // channel nobody reads; then process everything that
                    // made it in. Every accepted action is applied.
                    self.action_rx.close();
                    let mut drained = 0usize;
                    while let Ok(message) = self.action_rx.try_recv() {
                        self.handle(message);
                        drained += 1;
                    }
                    info!(drained, "dispatch worker draining complete");
                    break;
                }
                message = self.action_rx.recv() => {
                    match message {
                        Some(message) => self.handle(message),
                        None => break,
                    }
                }
            }
        }
        debug!("dispatch worker stopped");
    }

    fn handle(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Action(action) => self.process(action),
            WorkerMessage::Settle(done) => drop(done),
        }
    }

    fn process(&mut self, action: Action) {
        let Some(action) = self
            .pipeline
            .run_before(action, &self.committed)
        else {
            return;
        };

        let outcome = if action.is_history_replay() {
            self.replay(&action)
        } else if action.kind == kinds::HISTORY_BATCH_START
            || action.kind == kinds::HISTORY_BATCH_END
        {
            self.batch_control(&action);
            Some(Vec::new())
        } else {
            self.reduce(&action)
        };

        let Some(changes) = outcome else {
            return;
        };

        // Commit happened (or the action was a no-op); run the after chain
        // and mirror component changes into the spatial index.
        self.pipeline.run_after(&action, &self.committed, &changes);

        if !changes.is_empty() {
            if let Ok(mut spatial) = self.spatial.lock() {
                for change in &changes {
                    spatial.apply_change(change);
                }
            }
        }
    }

    /// Run the reducer and commit. `None` means the action failed and
    /// nothing was committed.
    fn reduce(&mut self, action: &Action) -> Option<Vec<Change>> {
        let Some(reducer) = self.reducers.get(&action.kind) else {
            warn!(kind = %action.kind, "{}", EngineError::UnknownAction(action.kind.clone()));
            return None;
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            reducer(&self.committed, action)
        }));
        let new_state = match result {
            Ok(Ok(state)) => state,
            Ok(Err(err)) => {
                // Committed state untouched; the failure affects only this
                // action.
                warn!(kind = %action.kind, error = %err, "reducer rejected action");
                return None;
            }
            Err(_) => {
                error!(kind = %action.kind, "reducer panicked, action aborted");
                return None;
            }
        };

        let new_value = match new_state.to_value() {
            Ok(value) => value,
            Err(err) => {
                error!(kind = %action.kind, error = %err, "state serialization failed");
                return None;
            }
        };
        let changes = diff::diff(&self.committed_value, &new_value);
        self.commit(new_state, new_value, &changes);
        Some(changes)
    }

    /// Apply an undo or redo replay from the history timeline.
    fn replay(&mut self, action: &Action) -> Option<Vec<Change>> {
        let changes = {
            let mut history = self.history.lock().ok()?;
            if action.kind == kinds::HISTORY_UNDO {
                history.undo()
            } else {
                history.redo()
            }
        };
        let Some(changes) = changes else {
            debug!(kind = %action.kind, "nothing to replay");
            return None;
        };

        let new_value = diff::apply(self.committed_value.clone(), &changes);
        match AppState::from_value(new_value.clone()) {
            Ok(new_state) => {
                self.commit(new_state, new_value, &changes);
                Some(changes)
            }
            Err(err) => {
                error!(kind = %action.kind, error = %err, "replay produced invalid state");
                None
            }
        }
    }

    fn batch_control(&mut self, action: &Action) {
        let id = action
            .payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Ok(mut history) = self.history.lock() else {
            return;
        };
        let result = if action.kind == kinds::HISTORY_BATCH_START {
            history.start_batch(id)
        } else {
            history.end_batch(id)
        };
        if let Err(err) = result {
            // The engine-side gate makes this unreachable in practice.
            warn!(kind = %action.kind, error = %err, "batch control failed");
        }
    }

    /// Atomically publish the new state, then notify subscribers.
    ///
    /// The fan-out snapshots matching callbacks and invokes them without
    /// holding the registry lock, so a callback is free to subscribe or
    /// unsubscribe.
    fn commit(&mut self, new_state: AppState, new_value: Value, changes: &[Change]) {
        self.committed = Arc::new(new_state);
        self.committed_value = new_value;
        let _ = self.state_tx.send(Arc::clone(&self.committed));

        if !changes.is_empty() {
            subscription::notify(&self.subscribers, changes);
        }
    }
}
