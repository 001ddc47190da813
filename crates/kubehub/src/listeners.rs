//! State listeners: callbacks fired when a watcher starts or is cancelled.

use std::fmt;
use std::sync::Arc;

/// A state-change callback. Identity is the allocation, not the behavior: two
/// listeners built from identical closures are distinct, clones are the same.
#[derive(Clone)]
pub struct StateListener {
    cb: Arc<dyn Fn() + Send + Sync>,
}

impl StateListener {
    pub fn new(cb: impl Fn() + Send + Sync + 'static) -> Self {
        Self { cb: Arc::new(cb) }
    }

    pub fn same(&self, other: &StateListener) -> bool {
        Arc::ptr_eq(&self.cb, &other.cb)
    }

    pub(crate) fn call(&self) {
        (self.cb)()
    }
}

impl fmt::Debug for StateListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateListener").field("ptr", &Arc::as_ptr(&self.cb).cast::<()>()).finish()
    }
}

struct Entry {
    listener: StateListener,
    once: bool,
}

/// Listener set guarded by the owning watcher's lock.
///
/// Notification is split in two so no callback runs inside the critical section:
/// [`take_snapshot`](Self::take_snapshot) under the lock, then invoke after release.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Vec<Entry>,
}

impl ListenerRegistry {
    pub fn add(&mut self, listener: StateListener) {
        self.entries.push(Entry { listener, once: false });
    }

    /// Register a listener that is dropped from the set when it is next notified.
    pub fn add_once(&mut self, listener: StateListener) {
        self.entries.push(Entry { listener, once: true });
    }

    /// Remove the first registration of `listener`. Order of the rest is not kept.
    pub fn remove(&mut self, listener: &StateListener) -> bool {
        match self.entries.iter().position(|e| e.listener.same(listener)) {
            Some(i) => {
                self.entries.swap_remove(i);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Everything currently registered. One-shot entries leave the set here, so a
    /// one-shot listener is handed out by exactly one snapshot.
    pub fn take_snapshot(&mut self) -> Vec<StateListener> {
        let snap = self.entries.iter().map(|e| e.listener.clone()).collect();
        self.entries.retain(|e| !e.once);
        snap
    }
}

/// Invoke a snapshot taken with [`ListenerRegistry::take_snapshot`].
pub(crate) fn fire(snapshot: Vec<StateListener>) {
    for l in snapshot {
        l.call();
    }
}
