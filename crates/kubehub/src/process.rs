//! Applies ordered delta batches to the local cache and signals real changes.

use std::sync::Arc;

use kube::Resource;
use lazywatch_core::{Delta, DeltaKind, StoreError, WatchScope};
use lazywatch_store::{key_of, Store};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::trace;

/// Equality predicate used to suppress notifications for no-op updates.
pub type EqualsFn<K> = Arc<dyn Fn(&K, &K) -> bool + Send + Sync>;

pub struct DeltaProcessor<K> {
    scope: WatchScope,
    store: Arc<dyn Store<K>>,
    equals: EqualsFn<K>,
    events: mpsc::Sender<()>,
}

impl<K> Clone for DeltaProcessor<K> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            store: self.store.clone(),
            equals: self.equals.clone(),
            events: self.events.clone(),
        }
    }
}

impl<K> DeltaProcessor<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(scope: WatchScope, store: Arc<dyn Store<K>>, equals: EqualsFn<K>, events: mpsc::Sender<()>) -> Self {
        Self { scope, store, equals, events }
    }

    /// Apply `batch` oldest to newest. Returns how many change signals were emitted.
    ///
    /// A store failure stops the batch; deltas before it stay applied. Signal writes
    /// wait while the channel is full.
    pub async fn process(&self, batch: Vec<Delta<K>>) -> Result<usize, StoreError> {
        let mut signalled = 0;
        for Delta { kind, object } in batch {
            let verb = match kind {
                DeltaKind::Deleted => {
                    self.store.delete(&object)?;
                    "delete"
                }
                DeltaKind::Added | DeltaKind::Updated | DeltaKind::Replaced => {
                    let key = key_of(&object)?;
                    match self.store.get(&key)? {
                        Some(old) => {
                            let unchanged = (self.equals)(&old, &object);
                            self.store.update(object)?;
                            if unchanged {
                                counter!("watcher_deltas_suppressed_total", 1u64);
                                continue;
                            }
                            "update"
                        }
                        None => {
                            self.store.add(object)?;
                            "add"
                        }
                    }
                }
            };
            trace!(resource = %self.scope.resource(), ns = %self.scope.ns(), ?kind, "{}", verb);
            counter!("watcher_deltas_applied_total", 1u64, "verb" => verb);
            // Closed once the debouncer has exited; the cache write above still counts.
            let _ = self.events.send(()).await;
            signalled += 1;
        }
        Ok(signalled)
    }

    /// Current cache contents, used for resync and relist reconciliation.
    pub fn cached(&self) -> Vec<K> { self.store.list() }

    pub fn scope(&self) -> &WatchScope { &self.scope }
}
