#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use lazywatch_kubehub::{EngineHandlers, StateListener, StreamEngine, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Engine that hands its handlers to the test and then idles until cancelled.
pub struct Scripted<K> {
    tx: mpsc::UnboundedSender<(EngineHandlers<K>, CancellationToken)>,
    runs: Arc<AtomicUsize>,
}

impl<K: Send + Sync + 'static> StreamEngine<K> for Scripted<K> {
    fn run(&self, handlers: EngineHandlers<K>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send((handlers, cancel.clone()));
        Box::pin(async move { cancel.cancelled().await })
    }
}

pub struct Harness {
    pub watcher: Watcher<Pod>,
    pub runs: Arc<AtomicUsize>,
    pub wired: mpsc::UnboundedReceiver<(EngineHandlers<Pod>, CancellationToken)>,
}

impl Harness {
    pub fn runs(&self) -> usize { self.runs.load(Ordering::SeqCst) }

    /// Handlers of the (single) started stream.
    pub async fn handlers(&mut self) -> (EngineHandlers<Pod>, CancellationToken) {
        tokio::time::timeout(Duration::from_secs(5), self.wired.recv())
            .await
            .expect("engine was not started")
            .expect("engine channel closed")
    }
}

pub fn same_spec(a: &Pod, b: &Pod) -> bool { a.spec == b.spec }

pub fn harness() -> Harness {
    let (tx, wired) = mpsc::unbounded_channel();
    let runs = Arc::new(AtomicUsize::new(0));
    let engine = Scripted { tx, runs: runs.clone() };
    let watcher = Watcher::new("pods", Some("ns1"), engine, same_spec).unwrap();
    Harness { watcher, runs, wired }
}

pub fn pod(name: &str, image: &str) -> Pod {
    let mut p = Pod::default();
    p.metadata.name = Some(name.to_string());
    p.metadata.namespace = Some("ns1".to_string());
    p.spec = Some(PodSpec {
        containers: vec![Container { name: "main".into(), image: Some(image.into()), ..Default::default() }],
        ..Default::default()
    });
    p
}

pub fn image(p: &Pod) -> String {
    p.spec.as_ref().and_then(|s| s.containers[0].image.clone()).unwrap_or_default()
}

pub fn counting_listener() -> (StateListener, Arc<AtomicUsize>) {
    let n = Arc::new(AtomicUsize::new(0));
    let c = n.clone();
    (StateListener::new(move || { c.fetch_add(1, Ordering::SeqCst); }), n)
}
