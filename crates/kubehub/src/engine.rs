//! Boundary between a watcher and the list+watch engine that feeds it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::debounce::SettleSignal;
use crate::errors::ErrorHandler;
use crate::process::DeltaProcessor;

/// Raised by the engine once its initial list has been applied to the cache.
#[derive(Clone, Default)]
pub struct SyncFlag {
    synced: Arc<AtomicBool>,
    wake: Option<SettleSignal>,
}

impl SyncFlag {
    /// A flag that also wakes settle waiters when it is raised, so an empty
    /// initial list still ends a wait for sync.
    pub(crate) fn waking(wake: SettleSignal) -> Self {
        Self { synced: Arc::default(), wake: Some(wake) }
    }

    pub fn new() -> Self { Self::default() }

    pub fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::AcqRel) {
            if let Some(wake) = &self.wake {
                wake.broadcast();
            }
        }
    }

    pub fn is_synced(&self) -> bool { self.synced.load(Ordering::Acquire) }
}

/// Everything an engine needs to report into a watcher.
pub struct EngineHandlers<K> {
    pub processor: DeltaProcessor<K>,
    pub errors: ErrorHandler,
    pub synced: SyncFlag,
}

impl<K> Clone for EngineHandlers<K> {
    fn clone(&self) -> Self {
        Self { processor: self.processor.clone(), errors: self.errors.clone(), synced: self.synced.clone() }
    }
}

/// Drives list+watch for one collection: calls `handlers.processor` with ordered
/// delta batches, `handlers.errors` on stream faults, and raises `handlers.synced`
/// after the first full list. The returned future runs until `cancel` fires.
pub trait StreamEngine<K>: Send + Sync + 'static {
    fn run(&self, handlers: EngineHandlers<K>, cancel: CancellationToken) -> BoxFuture<'static, ()>;
}
