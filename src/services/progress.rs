use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::models::batch::BatchSnapshot;

type Callback = Arc<dyn Fn(BatchSnapshot) + Send + Sync>;

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<u64, Callback>>,
    latest: RwLock<Option<BatchSnapshot>>,
}

/// Broadcasts batch snapshots to subscribers.
///
/// Every subscriber receives its own clone of the snapshot; nothing handed
/// out aliases the job table. Callbacks run on the emitting task and must
/// not block.
#[derive(Clone, Default)]
pub struct ProgressEmitter {
    inner: Arc<Inner>,
}

impl ProgressEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every future snapshot. The returned
    /// subscription unsubscribes when dropped. Callbacks run on the job
    /// table's task.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(BatchSnapshot) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(id, Arc::new(callback));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `snapshot` to every subscriber. A callback that panics is
    /// unsubscribed; the others still receive the snapshot.
    pub fn emit(&self, snapshot: BatchSnapshot) {
        // Clone the list so callbacks may unsubscribe without deadlocking.
        let callbacks: Vec<(u64, Callback)> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();
        for (id, callback) in callbacks {
            let delivered = catch_unwind(AssertUnwindSafe(|| callback(snapshot.clone())));
            if delivered.is_err() {
                tracing::error!(subscriber = id, "Progress subscriber panicked; unsubscribing");
                self.inner.subscribers.lock().remove(&id);
            }
        }
        *self.inner.latest.write() = Some(snapshot);
    }

    /// Most recently emitted snapshot.
    pub fn latest(&self) -> Option<BatchSnapshot> {
        self.inner.latest.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Handle returned by [`ProgressEmitter::subscribe`].
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.lock().remove(&self.id);
        }
    }
}
