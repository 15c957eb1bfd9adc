//! Path-based subscriber registry.
//!
//! External collaborators register callbacks under dot-separated state paths
//! and are notified after each commit with the changes touching their path.
//! Subscribers are non-owning in both directions: the registry hands out an
//! explicit [`Subscription`] handle holding only a weak pointer, so a
//! forgotten handle never keeps the engine alive and a dropped engine never
//! keeps callbacks alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::diff::Change;

/// Callback invoked with each matching change.
pub type SubscriberCallback = Arc<dyn Fn(&Change) + Send + Sync>;

/// Optional predicate narrowing which changes a subscriber sees.
pub type SubscriberFilter = Arc<dyn Fn(&Change) -> bool + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: SubscriberCallback,
    filter: Option<SubscriberFilter>,
}

/// Registry state shared between the engine and subscription handles.
#[derive(Default)]
pub struct SubscriberRegistry {
    by_path: HashMap<String, Vec<Subscriber>>,
    next_id: u64,
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("paths", &self.by_path.len())
            .field(
                "subscribers",
                &self.by_path.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl SubscriberRegistry {
    /// Create an empty registry behind the shared lock.
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }

    fn subscribe(
        &mut self,
        path: String,
        callback: SubscriberCallback,
        filter: Option<SubscriberFilter>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.by_path.entry(path).or_default().push(Subscriber {
            id,
            callback,
            filter,
        });
        id
    }

    fn unsubscribe(&mut self, path: &str, id: u64) -> bool {
        let Some(subscribers) = self.by_path.get_mut(path) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() < before;
        if subscribers.is_empty() {
            self.by_path.remove(path);
        }
        removed
    }

    /// Snapshot the callbacks matching a commit's changes.
    ///
    /// Per-path registration order is preserved; the relative order across
    /// distinct paths is unspecified.
    fn matching(&self, changes: &[Change]) -> Vec<(SubscriberCallback, Change)> {
        let mut matched = Vec::new();
        for (path, subscribers) in &self.by_path {
            for change in changes {
                if !paths_related(path, &change.path) {
                    continue;
                }
                for subscriber in subscribers {
                    if let Some(filter) = &subscriber.filter {
                        if !filter(change) {
                            continue;
                        }
                    }
                    matched.push((Arc::clone(&subscriber.callback), change.clone()));
                }
            }
        }
        matched
    }

    /// Number of registered subscribers across all paths.
    pub fn len(&self) -> usize {
        self.by_path.values().map(Vec::len).sum()
    }

    /// Whether there are no subscribers.
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

/// Fan a commit's changes out to matching subscribers.
///
/// The registry lock is held only while matching; callbacks run after it is
/// released, so a callback may subscribe, unsubscribe, or drop its own
/// `Subscription` handle without re-entering the lock. A panicking callback
/// is isolated so it cannot poison the dispatch worker.
pub fn notify(registry: &Arc<Mutex<SubscriberRegistry>>, changes: &[Change]) {
    let matched = match registry.lock() {
        Ok(guard) => guard.matching(changes),
        Err(poisoned) => poisoned.into_inner().matching(changes),
    };
    for (callback, change) in matched {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(&change);
        }))
        .is_err()
        {
            tracing::error!(path = %change.path, "subscriber callback panicked");
        }
    }
}

/// A subscribed path matches a change when either is a dot-boundary prefix
/// of the other: a subscriber at `components` hears `components.c1.bounds.x`,
/// and a subscriber at `components.c1.bounds.x` hears the deletion of
/// `components.c1`. The empty path matches everything.
fn paths_related(subscribed: &str, changed: &str) -> bool {
    if subscribed.is_empty() {
        return true;
    }
    is_dot_prefix(subscribed, changed) || is_dot_prefix(changed, subscribed)
}

fn is_dot_prefix(prefix: &str, path: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'.'))
}

/// Handle returned by `subscribe`.
///
/// Call [`unsubscribe`](Self::unsubscribe) when the observer goes away.
/// Dropping the handle also unsubscribes as a leak backstop, with a log
/// record so the missing explicit call is visible.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<Mutex<SubscriberRegistry>>,
    path: String,
    id: u64,
    released: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(registry: &Arc<Mutex<SubscriberRegistry>>, path: String, id: u64) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            path,
            id,
            released: false,
        }
    }

    /// The subscribed path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Remove the subscriber from the registry.
    pub fn unsubscribe(mut self) {
        self.release(false);
    }

    fn release(&mut self, from_drop: bool) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.unsubscribe(&self.path, self.id);
            }
            if from_drop {
                tracing::debug!(path = %self.path, "subscription dropped without explicit unsubscribe");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release(true);
    }
}

pub(crate) fn register(
    registry: &Arc<Mutex<SubscriberRegistry>>,
    path: impl Into<String>,
    callback: SubscriberCallback,
    filter: Option<SubscriberFilter>,
) -> Subscription {
    let path = path.into();
    // Registry callbacks run under catch_unwind, so a poisoned lock still
    // holds consistent data and can be recovered.
    let id = match registry.lock() {
        Ok(mut guard) => guard.subscribe(path.clone(), callback, filter),
        Err(poisoned) => poisoned
            .into_inner()
            .subscribe(path.clone(), callback, filter),
    };
    Subscription::new(registry, path, id)
}
