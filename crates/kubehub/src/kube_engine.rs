//! Stream engine backed by `kube::runtime::watcher`.

use std::fmt::Debug;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Resource;
use lazywatch_core::{Delta, WatchError};
use lazywatch_store::key_of;
use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DEFAULT_RESYNC_PERIOD;
use crate::engine::{EngineHandlers, StreamEngine};

pub struct KubeEngine<K> {
    api: Api<K>,
    config: watcher::Config,
    resync: Duration,
}

impl<K> KubeEngine<K> {
    pub fn new(api: Api<K>) -> Self {
        Self { api, config: watcher::Config::default(), resync: DEFAULT_RESYNC_PERIOD }
    }

    /// Zero disables resync.
    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync = period;
        self
    }

    pub fn with_watcher_config(mut self, config: watcher::Config) -> Self {
        self.config = config;
        self
    }
}

impl<K> StreamEngine<K> for KubeEngine<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn run(&self, handlers: EngineHandlers<K>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        Box::pin(pump(self.api.clone(), self.config.clone(), self.resync, handlers, cancel))
    }
}

async fn next_resync(tick: &mut Option<Interval>) {
    match tick {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn apply<K>(handlers: &EngineHandlers<K>, batch: Vec<Delta<K>>)
where
    K: Resource + Clone + Send + Sync + 'static,
{
    if batch.is_empty() {
        return;
    }
    let scope = handlers.processor.scope();
    if let Err(e) = handlers.processor.process(batch).await {
        warn!(resource = %scope.resource(), ns = %scope.ns(), error = %e, "delta batch aborted");
    }
}

/// A relist replaces the known state: every listed object as `Replaced`, then a
/// `Deleted` for each cached object the list no longer contains.
fn relist_batch<K: Resource>(cached: Vec<K>, list: Vec<K>) -> Vec<Delta<K>> {
    let fresh: FxHashSet<_> = list.iter().filter_map(|o| key_of(o).ok()).collect();
    let gone = cached.into_iter().filter(|o| key_of(o).map(|k| !fresh.contains(&k)).unwrap_or(false));
    let mut batch: Vec<Delta<K>> = list.into_iter().map(Delta::replaced).collect();
    batch.extend(gone.map(Delta::deleted));
    batch
}

fn resync_batch<K>(cached: Vec<K>) -> Vec<Delta<K>> {
    cached.into_iter().map(Delta::updated).collect()
}

/// Deltas for one watch event. `cached` is only read on a relist.
fn event_deltas<K: Resource>(event: Event<K>, cached: impl FnOnce() -> Vec<K>) -> Vec<Delta<K>> {
    match event {
        Event::Applied(o) => vec![Delta::updated(o)],
        Event::Deleted(o) => vec![Delta::deleted(o)],
        Event::Restarted(list) => relist_batch(cached(), list),
    }
}

async fn on_event<K>(handlers: &EngineHandlers<K>, event: Event<K>)
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let relist = match &event {
        Event::Restarted(list) => {
            let scope = handlers.processor.scope();
            debug!(resource = %scope.resource(), ns = %scope.ns(), count = list.len(), "watch restart");
            true
        }
        Event::Applied(_) | Event::Deleted(_) => false,
    };
    let batch = event_deltas(event, || handlers.processor.cached());
    apply(handlers, batch).await;
    if relist {
        handlers.synced.mark_synced();
    }
}

async fn on_resync<K>(handlers: &EngineHandlers<K>)
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let batch = resync_batch(handlers.processor.cached());
    let scope = handlers.processor.scope();
    debug!(resource = %scope.resource(), ns = %scope.ns(), count = batch.len(), "resync");
    apply(handlers, batch).await;
}

async fn pump<K>(api: Api<K>, config: watcher::Config, resync: Duration, handlers: EngineHandlers<K>, cancel: CancellationToken)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let stream = watcher::watcher(api, config).default_backoff();
    futures::pin_mut!(stream);
    let mut resync_tick = (!resync.is_zero()).then(|| {
        let mut i = interval_at(Instant::now() + resync, resync);
        i.set_missed_tick_behavior(MissedTickBehavior::Delay);
        i
    });
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                handlers.errors.handle(&WatchError::Cancelled);
                break;
            }
            _ = next_resync(&mut resync_tick) => on_resync(&handlers).await,
            ev = stream.next() => match ev {
                Some(Ok(event)) => on_event(&handlers, event).await,
                Some(Err(e)) => {
                    handlers.errors.handle(&crate::errors::watch_error_from(e));
                }
                None => {
                    handlers.errors.handle(&WatchError::EndOfStream);
                    break;
                }
            }
        }
    }
}
