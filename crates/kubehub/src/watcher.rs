//! Lazily started watcher over one resource collection in one namespace.
//!
//! The watcher starts its stream on first demand (`get`, `list`, `ensure_started`
//! or `start`), keeps a local cache current, and broadcasts a settle signal once a
//! burst of changes has gone quiet. All mutable state sits behind one mutex; state
//! listeners are always invoked after that mutex is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::BoxFuture;
use kube::Resource;
use lazywatch_core::{ObjectKey, StoreError, WatchScope};
use lazywatch_store::{MemStore, Store};
use metrics::counter;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::debounce::{run_debouncer, SettleSignal};
use crate::engine::{EngineHandlers, StreamEngine, SyncFlag};
use crate::errors::{Cancel, ErrorHandler};
use crate::listeners::{self, ListenerRegistry, StateListener};
use crate::process::{DeltaProcessor, EqualsFn};

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("watcher must be built inside a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    /// Stream tasks spawned, engine loop not yet running.
    Starting,
    Active,
    /// Terminal.
    Cancelled,
}

struct Running {
    cancel: CancellationToken,
    launched: Arc<AtomicBool>,
}

enum Phase {
    Idle,
    Running(Running),
    Cancelled,
}

struct Inner {
    phase: Phase,
    listeners: ListenerRegistry,
    synced: Option<SyncFlag>,
}

struct Shared<K> {
    scope: WatchScope,
    config: WatchConfig,
    engine: Arc<dyn StreamEngine<K>>,
    store: Arc<dyn Store<K>>,
    equals: EqualsFn<K>,
    settle: SettleSignal,
    runtime: Handle,
    inner: Mutex<Inner>,
}

/// Cheap to clone; clones share one session.
pub struct Watcher<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for Watcher<K> {
    fn clone(&self) -> Self { Self { shared: self.shared.clone() } }
}

pub struct WatcherBuilder<K> {
    resource: String,
    namespace: Option<String>,
    engine: Arc<dyn StreamEngine<K>>,
    equals: Option<EqualsFn<K>>,
    store: Option<Arc<dyn Store<K>>>,
    config: WatchConfig,
    runtime: Option<Handle>,
}

impl<K> WatcherBuilder<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Predicate deciding whether an update is a no-op. Without one every update notifies.
    pub fn equals(mut self, f: impl Fn(&K, &K) -> bool + Send + Sync + 'static) -> Self {
        self.equals = Some(Arc::new(f));
        self
    }

    pub fn store(mut self, store: Arc<dyn Store<K>>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: WatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime the stream tasks are spawned on; defaults to the current one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<Watcher<K>, WatcherError> {
        let runtime = match self.runtime {
            Some(h) => h,
            None => Handle::try_current()?,
        };
        let store: Arc<dyn Store<K>> = match self.store {
            Some(s) => s,
            None => Arc::new(MemStore::<K>::new()),
        };
        let equals: EqualsFn<K> = match self.equals {
            Some(f) => f,
            None => Arc::new(|_: &K, _: &K| false),
        };
        Ok(Watcher {
            shared: Arc::new(Shared {
                scope: WatchScope::new(&self.resource, self.namespace.as_deref()),
                config: self.config,
                engine: self.engine,
                store,
                equals,
                settle: SettleSignal::new(),
                runtime,
                inner: Mutex::new(Inner { phase: Phase::Idle, listeners: ListenerRegistry::default(), synced: None }),
            }),
        })
    }
}

impl<K> Watcher<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn builder(resource: &str, namespace: Option<&str>, engine: impl StreamEngine<K>) -> WatcherBuilder<K> {
        WatcherBuilder {
            resource: resource.to_string(),
            namespace: namespace.map(str::to_string),
            engine: Arc::new(engine),
            equals: None,
            store: None,
            config: WatchConfig::default(),
            runtime: None,
        }
    }

    /// Idle watcher with default store and config, spawning on the current runtime.
    pub fn new(
        resource: &str,
        namespace: Option<&str>,
        engine: impl StreamEngine<K>,
        equals: impl Fn(&K, &K) -> bool + Send + Sync + 'static,
    ) -> Result<Self, WatcherError> {
        Self::builder(resource, namespace, engine).equals(equals).build()
    }

    pub fn resource(&self) -> &str { self.shared.scope.resource() }

    pub fn namespace(&self) -> Option<&str> { self.shared.scope.namespace() }

    /// Register a listener called on every start and on cancellation.
    pub fn add_state_listener(&self, listener: &StateListener) {
        self.shared.lock().listeners.add(listener.clone());
    }

    pub fn remove_state_listener(&self, listener: &StateListener) -> bool {
        self.shared.lock().listeners.remove(listener)
    }

    /// Start unless already started or cancelled. `cb(true)` runs after this call
    /// started the stream; otherwise `cb(false)` runs immediately.
    pub fn ensure_started(&self, cb: impl FnOnce(bool) + Send + 'static) {
        let mut inner = self.shared.lock();
        if !matches!(inner.phase, Phase::Idle) {
            drop(inner);
            cb(false);
            return;
        }
        let slot = Mutex::new(Some(cb));
        inner.listeners.add_once(StateListener::new(move || {
            if let Some(cb) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                cb(true);
            }
        }));
        self.shared.start_locked(&mut inner);
        self.shared.notify(inner);
    }

    /// Start eagerly. Returns whether this call started the stream.
    pub fn start(&self) -> bool {
        let mut inner = self.shared.lock();
        if !matches!(inner.phase, Phase::Idle) {
            return false;
        }
        self.shared.start_locked(&mut inner);
        self.shared.notify(inner);
        true
    }

    /// Cached object by key, starting the stream first if needed. Does not wait
    /// for the initial sync; see [`has_synced`](Self::has_synced).
    pub fn get(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        self.demand();
        self.shared.store.get(key)
    }

    /// All cached objects, starting the stream first if needed.
    pub fn list(&self) -> Vec<K> {
        self.demand();
        self.shared.store.list()
    }

    /// True if never started, or the stream has applied its initial list.
    pub fn has_synced(&self) -> bool {
        self.shared.lock().synced.as_ref().map_or(true, SyncFlag::is_synced)
    }

    /// True while started and not cancelled.
    pub fn active(&self) -> bool {
        matches!(self.shared.lock().phase, Phase::Running(_))
    }

    pub fn state(&self) -> WatcherState {
        match &self.shared.lock().phase {
            Phase::Idle => WatcherState::Idle,
            Phase::Running(r) if r.launched.load(Ordering::Acquire) => WatcherState::Active,
            Phase::Running(_) => WatcherState::Starting,
            Phase::Cancelled => WatcherState::Cancelled,
        }
    }

    /// Stop the stream and notify listeners. Further calls are no-ops.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Receiver that moves each time a burst of changes has settled.
    pub fn settled(&self) -> watch::Receiver<u64> { self.shared.settle.subscribe() }

    /// The settle signal itself, e.g. to attach to a [`crate::SettleFanIn`].
    pub fn settle_signal(&self) -> &SettleSignal { &self.shared.settle }

    /// Start if needed and wait until the initial list is in the cache. Returns
    /// false if the watcher was cancelled first.
    pub async fn wait_synced(&self) -> bool {
        let mut settled = self.settled();
        self.demand();
        let cancel = match &self.shared.lock().phase {
            Phase::Running(r) => r.cancel.clone(),
            Phase::Idle | Phase::Cancelled => return false,
        };
        loop {
            if self.has_synced() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = settled.changed() => {
                    if changed.is_err() {
                        return self.has_synced();
                    }
                }
            }
        }
    }

    fn demand(&self) {
        let mut inner = self.shared.lock();
        if matches!(inner.phase, Phase::Idle) {
            self.shared.start_locked(&mut inner);
            self.shared.notify(inner);
        }
    }
}

impl<K> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot the listeners, release the lock, then invoke them.
    fn notify(&self, mut inner: MutexGuard<'_, Inner>) {
        let snapshot = inner.listeners.take_snapshot();
        drop(inner);
        listeners::fire(snapshot);
    }

    fn cancel(&self) {
        let mut inner = self.lock();
        match std::mem::replace(&mut inner.phase, Phase::Cancelled) {
            Phase::Running(r) => {
                r.cancel.cancel();
                info!(resource = %self.scope.resource(), ns = %self.scope.ns(), "watcher cancelled");
            }
            Phase::Idle => {
                debug!(resource = %self.scope.resource(), ns = %self.scope.ns(), "watcher cancelled before start");
            }
            Phase::Cancelled => return,
        }
        counter!("watcher_cancellations_total", 1u64);
        self.notify(inner);
    }
}

impl<K> Drop for Shared<K> {
    /// The last handle is gone: nothing can cancel the stream tasks any more.
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Phase::Running(r) = &inner.phase {
            r.cancel.cancel();
            debug!(resource = %self.scope.resource(), ns = %self.scope.ns(), "watcher dropped while running; stream stopped");
        }
    }
}

impl<K> Cancel for Shared<K>
where
    K: Send + Sync + 'static,
{
    fn cancel(&self) {
        Shared::cancel(self)
    }
}

impl<K> Shared<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Wire the debouncer and the engine loop. Caller holds the lock and has checked
    /// the phase is Idle; only spawns, never waits.
    fn start_locked(self: &Arc<Self>, inner: &mut Inner) {
        let cancel = CancellationToken::new();
        let launched = Arc::new(AtomicBool::new(false));
        let synced = SyncFlag::waking(self.settle.clone());
        let (event_tx, event_rx) = mpsc::channel::<()>(self.config.event_buffer.max(1));

        let target: Arc<dyn Cancel> = self.clone();
        let target: Weak<dyn Cancel> = Arc::downgrade(&target);
        let handlers = EngineHandlers {
            processor: DeltaProcessor::new(self.scope.clone(), self.store.clone(), self.equals.clone(), event_tx),
            errors: ErrorHandler::new(self.scope.clone(), target.clone()),
            synced: synced.clone(),
        };

        self.runtime.spawn(run_debouncer(event_rx, self.settle.clone(), self.config.quiet_period, cancel.clone()));
        let run = self.engine.run(handlers, cancel.clone());
        self.runtime.spawn(drive(run, self.scope.clone(), cancel.clone(), launched.clone(), target));

        inner.phase = Phase::Running(Running { cancel, launched });
        inner.synced = Some(synced);
        counter!("watcher_starts_total", 1u64);
    }
}

/// Runs the engine future until it ends or the session is cancelled. An engine that
/// gives up on its own cancels the watcher, so it stops reporting active.
async fn drive(
    run: BoxFuture<'static, ()>,
    scope: WatchScope,
    cancel: CancellationToken,
    launched: Arc<AtomicBool>,
    owner: Weak<dyn Cancel>,
) {
    launched.store(true, Ordering::Release);
    info!(resource = %scope.resource(), ns = %scope.ns(), "watcher started");
    tokio::select! {
        _ = run => {}
        _ = cancel.cancelled() => {}
    }
    if !cancel.is_cancelled() {
        warn!(resource = %scope.resource(), ns = %scope.ns(), "stream ended without cancellation; cancelling watcher");
        match owner.upgrade() {
            Some(w) => w.cancel(),
            None => cancel.cancel(),
        }
    }
    debug!(resource = %scope.resource(), ns = %scope.ns(), "watcher stopped");
}
