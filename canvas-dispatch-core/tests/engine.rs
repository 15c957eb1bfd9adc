//! End-to-end engine scenarios: dispatch, undo/redo, batching, subscribers,
//! spatial replay and persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use canvas_dispatch_core::prelude::*;

fn add_component(id: &str, x: f64, y: f64, w: f64, h: f64) -> Action {
    Action::new(
        kinds::ADD_COMPONENT,
        json!({
            "id": id,
            "kind": "frame",
            "bounds": { "x": x, "y": y, "width": w, "height": h },
        }),
    )
}

fn move_component(id: &str, x: f64, y: f64, w: f64, h: f64) -> Action {
    Action::new(
        kinds::UPDATE_COMPONENT,
        json!({
            "id": id,
            "bounds": { "x": x, "y": y, "width": w, "height": h },
        }),
    )
}

#[tokio::test]
async fn test_dispatch_commits_and_indexes() {
    let engine = Engine::builder().build();

    engine
        .dispatch(add_component("c1", 0.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;

    let state = engine.state();
    assert_eq!(state.components.len(), 1);
    assert_eq!(state.components["c1"].bounds.width, 50.0);
    assert_eq!(engine.query_point(25.0, 25.0), vec!["c1"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_get_state_paths() {
    let engine = Engine::builder().build();
    engine
        .dispatch(add_component("c1", 0.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;

    assert_eq!(
        engine.get_state("components.c1.bounds.width").unwrap(),
        Some(json!(50.0))
    );
    assert_eq!(engine.get_state("components.nope").unwrap(), None);
    assert!(matches!(
        engine.get_state(".components"),
        Err(EngineError::InvalidPath { .. })
    ));
    assert!(matches!(
        engine.get_state("components..c1"),
        Err(EngineError::InvalidPath { .. })
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_invalid_and_unknown_actions() {
    let engine = Engine::builder().build();

    assert!(matches!(
        engine.dispatch(Action::new("", json!({}))),
        Err(EngineError::InvalidAction(_))
    ));
    assert!(matches!(
        engine.dispatch(Action::new("a..b", json!({}))),
        Err(EngineError::InvalidAction(_))
    ));
    assert!(matches!(
        engine.dispatch(Action::new("theme/set", json!(42))),
        Err(EngineError::InvalidAction(_))
    ));

    // Unknown kinds pass shape validation and are dropped on the worker.
    engine
        .dispatch(Action::new("nobody/home", json!({})))
        .unwrap();
    engine.settle().await;
    assert_eq!(*engine.state(), AppState::default());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_reducer_failure_leaves_state_untouched() {
    let engine = Engine::builder().build();
    engine
        .dispatch(add_component("c1", 0.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;
    let before = engine.state();

    // Duplicate id: the reducer rejects, nothing commits.
    engine
        .dispatch(add_component("c1", 9.0, 9.0, 9.0, 9.0))
        .unwrap();
    engine.settle().await;
    assert_eq!(*engine.state(), *before);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_spatial_move_scenario() {
    let engine = Engine::builder().build();

    engine
        .dispatch(add_component("c1", 0.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;
    assert_eq!(engine.query_point(25.0, 25.0), vec!["c1"]);

    engine
        .dispatch(move_component("c1", 100.0, 100.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;
    assert!(engine.query_point(25.0, 25.0).is_empty());
    assert_eq!(engine.query_point(125.0, 125.0), vec!["c1"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_undo_redo_replay_matches_recorded_states() {
    let engine = Engine::builder().build();

    engine
        .dispatch(add_component("c1", 0.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;

    // Three successive moves, recording each resulting state.
    let mut snapshots = Vec::new();
    for i in 1..=3 {
        let offset = (i as f64) * 10.0;
        engine
            .dispatch(move_component("c1", offset, offset, 50.0, 50.0))
            .unwrap();
        engine.settle().await;
        snapshots.push(engine.state());
    }

    // Undo all three moves.
    for _ in 0..3 {
        engine.undo().unwrap();
    }
    engine.settle().await;
    assert_eq!(engine.state().components["c1"].bounds.x, 0.0);

    // Redo them; each intermediate state equals the originally recorded one.
    for snapshot in &snapshots {
        engine.redo().unwrap();
        engine.settle().await;
        assert_eq!(*engine.state(), **snapshot);
    }

    // Spatial index followed the replays.
    assert_eq!(engine.query_point(55.0, 55.0), vec!["c1"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_undo_restores_spatial_index() {
    let engine = Engine::builder().build();
    engine
        .dispatch(add_component("c1", 0.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;

    engine.undo().unwrap();
    engine.settle().await;
    assert!(engine.state().components.is_empty());
    assert!(engine.query_point(25.0, 25.0).is_empty());

    engine.redo().unwrap();
    engine.settle().await;
    assert_eq!(engine.query_point(25.0, 25.0), vec!["c1"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_batch_undone_in_one_step() {
    let engine = Engine::builder().build();
    engine
        .dispatch(add_component("c1", 0.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;

    engine.start_batch("drag").unwrap();
    engine
        .dispatch(move_component("c1", 10.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine
        .dispatch(move_component("c1", 20.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine.end_batch("drag").unwrap();
    engine.settle().await;

    assert_eq!(engine.state().components["c1"].bounds.x, 20.0);

    // One undo reverts both moves.
    engine.undo().unwrap();
    engine.settle().await;
    assert_eq!(engine.state().components["c1"].bounds.x, 0.0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_nested_batch_rejected_synchronously() {
    let engine = Engine::builder().build();
    engine.start_batch("one").unwrap();
    assert!(matches!(
        engine.start_batch("two"),
        Err(EngineError::BatchAlreadyActive(_))
    ));
    assert!(matches!(
        engine.end_batch("two"),
        Err(EngineError::BatchNotActive(_))
    ));
    engine.end_batch("one").unwrap();
    engine.shutdown().await;
}

#[tokio::test]
async fn test_history_eviction_bounds() {
    let mut config = EngineConfig::default();
    config.max_history_entries = 5;
    let engine = Engine::builder().config(config).build();

    engine
        .dispatch(add_component("c1", 0.0, 0.0, 50.0, 50.0))
        .unwrap();
    for i in 0..20 {
        engine
            .dispatch(move_component("c1", i as f64, 0.0, 50.0, 50.0))
            .unwrap();
    }
    engine.settle().await;

    let timeline = engine.get_history_timeline(0, 100);
    assert_eq!(timeline.len(), 5);
    // Cursor sits on the newest surviving entry and undo still works.
    assert!(timeline.last().unwrap().is_current);
    engine.undo().unwrap();
    engine.settle().await;
    assert_eq!(engine.state().components["c1"].bounds.x, 18.0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_subscribers_notified_at_changed_paths() {
    let engine = Engine::builder().build();

    let component_changes = Arc::new(AtomicUsize::new(0));
    let theme_changes = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&component_changes);
    let cb: SubscriberCallback = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let sub_components = engine.subscribe("components", cb, None);

    let counter = Arc::clone(&theme_changes);
    let cb: SubscriberCallback = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let sub_theme = engine.subscribe("theme", cb, None);

    engine
        .dispatch(add_component("c1", 0.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;

    assert!(component_changes.load(Ordering::SeqCst) >= 1);
    assert_eq!(theme_changes.load(Ordering::SeqCst), 0);

    engine
        .dispatch(Action::new(kinds::SET_THEME, json!({ "name": "dark" })))
        .unwrap();
    engine.settle().await;
    assert_eq!(theme_changes.load(Ordering::SeqCst), 1);

    // After unsubscribe, silence.
    let seen = component_changes.load(Ordering::SeqCst);
    sub_components.unsubscribe();
    sub_theme.unsubscribe();
    engine
        .dispatch(move_component("c1", 5.0, 5.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;
    assert_eq!(component_changes.load(Ordering::SeqCst), seen);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_unsubscribing_in_callback_does_not_stall_worker() {
    let engine = Engine::builder().build();

    let (observer_cb, observed) = {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let cb: SubscriberCallback = Arc::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (cb, count)
    };
    let observer = engine.subscribe("theme", observer_cb, None);

    // This callback drops the other subscription from inside the fan-out.
    let slot = Arc::new(Mutex::new(Some(observer)));
    let canceller_slot = Arc::clone(&slot);
    let canceller: SubscriberCallback = Arc::new(move |_| {
        if let Some(sub) = canceller_slot.lock().unwrap().take() {
            sub.unsubscribe();
        }
    });
    let _canceller = engine.subscribe("theme", canceller, None);

    engine
        .dispatch(Action::new(kinds::SET_THEME, json!({ "name": "dark" })))
        .unwrap();
    engine.settle().await;

    let seen = observed.load(Ordering::SeqCst);
    engine
        .dispatch(Action::new(kinds::SET_THEME, json!({ "name": "light" })))
        .unwrap();
    engine.settle().await;
    assert_eq!(observed.load(Ordering::SeqCst), seen);
    assert_eq!(engine.state().theme, "light");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_receives_change_payload() {
    let engine = Engine::builder().build();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let cb: SubscriberCallback = Arc::new(move |change| {
        sink.lock().unwrap().push((change.path.clone(), change.kind));
    });
    let _sub = engine.subscribe("canvas.zoom", cb, None);

    engine
        .dispatch(Action::new(kinds::UPDATE_CANVAS, json!({ "zoom": 2.0 })))
        .unwrap();
    engine.settle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "canvas.zoom");
    assert_eq!(seen[0].1, ChangeKind::Update);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_then_rejects() {
    let engine = Engine::builder().build();

    for i in 0..50 {
        engine
            .dispatch(add_component(&format!("c{i}"), (i as f64) * 100.0, 0.0, 10.0, 10.0))
            .unwrap();
    }
    engine.shutdown().await;

    // Every queued action was processed before the worker exited.
    assert_eq!(engine.state().components.len(), 50);

    // New work is rejected.
    assert!(matches!(
        engine.dispatch(add_component("late", 0.0, 0.0, 1.0, 1.0)),
        Err(EngineError::Concurrency)
    ));
}

#[tokio::test]
async fn test_dispatch_racing_shutdown_is_applied_or_rejected() {
    let engine = Arc::new(Engine::builder().build());

    // A producer dispatching flat out while shutdown runs concurrently.
    // Every accepted dispatch must be visible in the final state; a lost
    // race must surface as an error, never a silent drop.
    let producer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut accepted = 0usize;
            for i in 0..u32::MAX {
                let id = format!("c{i}");
                let x = (i as f64) * 100.0;
                match engine.dispatch(add_component(&id, x, 0.0, 10.0, 10.0)) {
                    Ok(()) => accepted += 1,
                    Err(EngineError::Concurrency) => break,
                    Err(err) => panic!("unexpected dispatch error: {err}"),
                }
                if i % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            accepted
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.shutdown().await;
    let accepted = producer.await.unwrap();

    assert_eq!(engine.state().components.len(), accepted);
}

#[tokio::test]
async fn test_shutdown_flushes_snapshot_and_restore() {
    let backend = Arc::new(MemoryBackend::new());

    {
        let engine = Engine::builder()
            .backend(Arc::clone(&backend) as Arc<dyn PersistenceBackend>)
            .build();
        engine
            .dispatch(add_component("c1", 0.0, 0.0, 50.0, 50.0))
            .unwrap();
        engine.settle().await;
        engine.shutdown().await;
    }

    let saved = backend.load("autosave").unwrap().expect("final flush");
    assert!(saved.get("components").and_then(|c| c.get("c1")).is_some());

    // A fresh engine restores the snapshot and rebuilds the index.
    let engine = Engine::builder()
        .backend(Arc::clone(&backend) as Arc<dyn PersistenceBackend>)
        .restore()
        .build();
    assert_eq!(engine.state().components.len(), 1);
    assert_eq!(engine.query_point(25.0, 25.0), vec!["c1"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_custom_reducer_registration() {
    let engine = Engine::builder()
        .reducer("project/rename_upper", |state, action| {
            let name = action
                .payload
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let mut next = state.clone();
            next.project.name = name.to_uppercase();
            Ok(next)
        })
        .build();

    engine
        .dispatch(Action::new("project/rename_upper", json!({ "name": "hero" })))
        .unwrap();
    engine.settle().await;
    assert_eq!(engine.state().project.name, "HERO");

    // Custom actions are undoable like any other.
    engine.undo().unwrap();
    engine.settle().await;
    assert_eq!(engine.state().project.name, "");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_producers() {
    let engine = Arc::new(Engine::builder().build());

    let mut handles = Vec::new();
    for t in 0..4 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                let id = format!("t{t}-c{i}");
                let x = (t * 25 + i) as f64 * 100.0;
                engine
                    .dispatch(add_component(&id, x, 0.0, 10.0, 10.0))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    engine.settle().await;

    assert_eq!(engine.state().components.len(), 100);
    assert_eq!(engine.index_statistics().unwrap().component_count, 100);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_overlap_queries_via_engine() {
    let engine = Engine::builder().build();
    engine
        .dispatch(add_component("a", 0.0, 0.0, 50.0, 50.0))
        .unwrap();
    engine
        .dispatch(add_component("b", 40.0, 40.0, 50.0, 50.0))
        .unwrap();
    engine.settle().await;

    assert_eq!(engine.detect_overlaps("a", 0.0), vec!["b"]);
    assert!(engine.detect_overlaps("a", 101.0).is_empty());
    assert_eq!(
        engine.query_region(&BoundingBox::new(0.0, 0.0, 45.0, 45.0)),
        vec!["a", "b"]
    );
    assert_eq!(engine.nearest(0.0, 0.0, 200.0, 1), vec!["a"]);

    engine.shutdown().await;
}
