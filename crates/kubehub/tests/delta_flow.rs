#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::{harness, image, pod};
use lazywatch_kubehub::{Delta, ObjectKey, SettleFanIn, StoreError};

#[tokio::test]
async fn pods_scenario_suppresses_equal_update() {
    let mut h = harness();
    assert!(h.watcher.list().is_empty());
    let (handlers, _) = h.handlers().await;
    let mut settled = h.watcher.settled();

    let signals = handlers
        .processor
        .process(vec![
            Delta::added(pod("podA", "nginx:1")),
            Delta::added(pod("podB", "nginx:1")),
            Delta::updated(pod("podA", "nginx:1")),
        ])
        .await
        .unwrap();
    assert_eq!(signals, 2);

    let mut names: Vec<_> = h.watcher.list().into_iter().filter_map(|p| p.metadata.name).collect();
    names.sort();
    assert_eq!(names, vec!["podA", "podB"]);

    tokio::time::timeout(Duration::from_secs(2), settled.changed()).await.unwrap().unwrap();
    assert_eq!(*settled.borrow_and_update(), 1);
}

#[tokio::test]
async fn equal_update_still_overwrites_cache() {
    let mut h = harness();
    h.watcher.start();
    let (handlers, _) = h.handlers().await;

    let mut first = pod("a", "nginx:1");
    first.metadata.resource_version = Some("1".into());
    let mut second = pod("a", "nginx:1");
    second.metadata.resource_version = Some("2".into());

    assert_eq!(handlers.processor.process(vec![Delta::added(first)]).await.unwrap(), 1);
    assert_eq!(handlers.processor.process(vec![Delta::updated(second)]).await.unwrap(), 0);
    let cached = h.watcher.get(&ObjectKey::namespaced("ns1", "a")).unwrap().unwrap();
    assert_eq!(cached.metadata.resource_version.as_deref(), Some("2"));

    // a real change and a relist of an unseen object both signal
    let n = handlers
        .processor
        .process(vec![Delta::updated(pod("a", "nginx:2")), Delta::replaced(pod("b", "redis"))])
        .await
        .unwrap();
    assert_eq!(n, 2);
    assert_eq!(image(&h.watcher.get(&ObjectKey::namespaced("ns1", "a")).unwrap().unwrap()), "nginx:2");
}

#[tokio::test]
async fn failed_delete_aborts_rest_of_batch() {
    let mut h = harness();
    h.watcher.start();
    let (handlers, _) = h.handlers().await;

    let err = handlers
        .processor
        .process(vec![
            Delta::added(pod("c", "nginx")),
            Delta::deleted(pod("ghost", "nginx")),
            Delta::added(pod("d", "nginx")),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(k) if k == ObjectKey::namespaced("ns1", "ghost")));
    assert!(h.watcher.get(&ObjectKey::namespaced("ns1", "c")).unwrap().is_some());
    assert!(h.watcher.get(&ObjectKey::namespaced("ns1", "d")).unwrap().is_none());
}

#[tokio::test]
async fn delete_removes_and_signals() {
    let mut h = harness();
    h.watcher.start();
    let (handlers, _) = h.handlers().await;
    let n = handlers
        .processor
        .process(vec![Delta::added(pod("a", "nginx")), Delta::deleted(pod("a", "nginx"))])
        .await
        .unwrap();
    assert_eq!(n, 2);
    assert!(h.watcher.list().is_empty());
}

#[tokio::test(start_paused = true)]
async fn burst_wakes_waiters_once() {
    let mut h = harness();
    h.watcher.start();
    let (handlers, _) = h.handlers().await;
    let signal = h.watcher.settle_signal().clone();

    for i in 0..12 {
        let name = format!("p{i}");
        handlers.processor.process(vec![Delta::added(pod(&name, "nginx"))]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(signal.generation(), 0, "no broadcast while the burst is ongoing");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(signal.generation(), 1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(signal.generation(), 1);
}

#[tokio::test(start_paused = true)]
async fn no_settle_after_cancel() {
    let mut h = harness();
    h.watcher.start();
    let (handlers, _) = h.handlers().await;
    h.watcher.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // processing already scheduled may still land in the cache
    handlers.processor.process(vec![Delta::added(pod("late", "nginx"))]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.watcher.settle_signal().generation(), 0);
    assert_eq!(h.watcher.list().len(), 1);
}

#[tokio::test]
async fn wait_synced_returns_after_initial_list() {
    let mut h = harness();
    let w = h.watcher.clone();
    let waiter = tokio::spawn(async move { w.wait_synced().await });
    let (handlers, _) = h.handlers().await;
    assert!(!waiter.is_finished());

    handlers.processor.process(vec![Delta::replaced(pod("a", "nginx"))]).await.unwrap();
    handlers.synced.mark_synced();
    let synced = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
    assert!(synced);
    assert_eq!(h.watcher.list().len(), 1);
}

#[tokio::test]
async fn wait_synced_gives_up_on_cancel() {
    let mut h = harness();
    let w = h.watcher.clone();
    let waiter = tokio::spawn(async move { w.wait_synced().await });
    let _ = h.handlers().await;
    h.watcher.cancel();
    let synced = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
    assert!(!synced);
}

#[tokio::test]
async fn fan_in_joins_watchers() {
    let mut a = harness();
    let mut b = harness();
    a.watcher.start();
    b.watcher.start();
    let (ha, _) = a.handlers().await;
    let (hb, _) = b.handlers().await;

    let mut fan = SettleFanIn::new();
    fan.attach(a.watcher.settle_signal());
    fan.attach(b.watcher.settle_signal());
    let mut any = fan.subscribe();

    hb.processor.process(vec![Delta::added(pod("x", "nginx"))]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), any.changed()).await.unwrap().unwrap();
    any.borrow_and_update();

    ha.processor.process(vec![Delta::added(pod("y", "nginx"))]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), any.changed()).await.unwrap().unwrap();
}
