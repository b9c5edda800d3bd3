use std::sync::Arc;
use std::time::Duration;

use horizon_coord::{CoordConfig, Coordinator, Phase};
use horizon_core::{ClientError, CoordError, CoordEvent, EventType, RawObject, ResourceKind, RunParams};
use horizon_kubehub::{MemoryCluster, ResourceClient};
use serde_json::json;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

fn coordinator(mc: &Arc<MemoryCluster>) -> Coordinator {
    Coordinator::with_backends(CoordConfig::new("coord-nginx"), mc.clone(), mc.clone())
}

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv()).await.expect("timed out waiting for event").expect("channel closed")
}

async fn quiet<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<T>) {
    if let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await {
        panic!("unexpected event {:?}", ev);
    }
}

fn pod(name: &str, ns: &str) -> RawObject {
    RawObject::new(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "namespace": ns, "labels": { "app": "app-name" } },
        "status": { "phase": "Running", "hostIP": "192.168.176.128", "podIP": "172.17.0.8" },
    }))
}

fn deployment(name: &str, ns: &str) -> RawObject {
    RawObject::new(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": ns },
        "status": { "replicas": 1, "readyReplicas": 1 },
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_fires_started_once_synced() {
    let mc = Arc::new(MemoryCluster::new());
    let coord = coordinator(&mc);
    let (tx, mut rx) = unbounded_channel();
    coord.on_coord_event(move |e| { let _ = tx.send(*e); });

    coord.start(CancellationToken::new()).await.expect("start");
    assert_eq!(coord.phase(), Phase::Started);
    assert_eq!(rx.try_recv().ok(), Some(CoordEvent::Started));

    assert!(matches!(coord.start(CancellationToken::new()).await, Err(CoordError::AlreadyStarted)));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_before_start_is_rejected() {
    let mc = Arc::new(MemoryCluster::new());
    let coord = coordinator(&mc);
    let err = coord.run(RunParams::new("appns", "app-name", "img")).await.unwrap_err();
    assert!(matches!(err, CoordError::NotStarted));
    assert_eq!(mc.create_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsynced_kind_fails_start_on_cancel() {
    let mc = Arc::new(MemoryCluster::new());
    mc.withhold_sync(&ResourceKind::pods());
    let coord = coordinator(&mc);
    let (tx, mut rx) = unbounded_channel();
    coord.on_coord_event(move |e| { let _ = tx.send(*e); });

    let cancel = CancellationToken::new();
    let c = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        c.cancel();
    });
    match coord.start(cancel).await {
        Err(CoordError::SyncTimeout { kind }) => assert_eq!(kind, "v1/pods"),
        other => panic!("expected sync failure, got {:?}", other),
    }
    assert_eq!(coord.phase(), Phase::Failed);
    assert!(rx.try_recv().is_err());
    assert!(matches!(coord.run(RunParams::new("ns", "a", "img")).await, Err(CoordError::NotStarted)));
    assert!(matches!(coord.start(CancellationToken::new()).await, Err(CoordError::AlreadyStarted)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_timeout_names_the_first_unsynced_kind() {
    let mc = Arc::new(MemoryCluster::new());
    mc.withhold_sync(&ResourceKind::deployments());
    let mut cfg = CoordConfig::new("c");
    cfg.sync_timeout = Some(Duration::from_millis(100));
    let coord = Coordinator::with_backends(cfg, mc.clone(), mc.clone());
    let err = coord.start(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "failed to sync resource apps/v1/deployments");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deployment_lifecycle_reaches_subscribers() {
    let mc = Arc::new(MemoryCluster::new());
    let kind = ResourceKind::deployments();
    let coord = coordinator(&mc);
    let (tx, mut rx) = unbounded_channel();
    coord.on_deployment_event(move |e| { let _ = tx.send(e.clone()); });
    coord.start(CancellationToken::new()).await.expect("start");

    coord.run(RunParams::new("appns", "app-name", "test.app.image:latest")).await.expect("run");
    let ev = next(&mut rx).await;
    assert_eq!(ev.ty, EventType::New);
    assert_eq!((ev.name.as_str(), ev.namespace.as_str()), ("app-name", "appns"));
    // no status yet: zero requested, zero ready
    assert!(ev.ready);

    let mut obj = mc.get(&kind, "appns", "app-name").await.expect("stored").into_json();
    obj["status"] = json!({ "replicas": 1, "readyReplicas": 0 });
    mc.upsert(&kind, RawObject::new(obj.clone())).await.expect("upsert");
    let ev = next(&mut rx).await;
    assert_eq!(ev.ty, EventType::Updated);
    assert_eq!((ev.replicas, ev.ready_replicas, ev.ready), (1, 0, false));

    assert!(mc.replay(&kind, "appns", "app-name").await);
    quiet(&mut rx).await;

    obj["status"]["readyReplicas"] = json!(1);
    mc.upsert(&kind, RawObject::new(obj)).await.expect("upsert");
    let ev = next(&mut rx).await;
    assert_eq!(ev.ty, EventType::Updated);
    assert!(ev.ready);

    mc.delete(&kind, "appns", "app-name").await.expect("deleted");
    assert_eq!(next(&mut rx).await.ty, EventType::Deleted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pods_created_from_a_deployment_callback_are_reported() {
    let mc = Arc::new(MemoryCluster::new());
    let coord = coordinator(&mc);

    let cluster = mc.clone();
    coord.on_deployment_event(move |e| {
        if e.ty == EventType::New {
            let cluster = cluster.clone();
            let ns = e.namespace.clone();
            tokio::spawn(async move {
                let _ = cluster.upsert(&ResourceKind::pods(), pod("app-name-7d9f", &ns)).await;
            });
        }
    });
    let (tx, mut rx) = unbounded_channel();
    coord.on_pod_event(move |e| { let _ = tx.send(e.clone()); });

    coord.start(CancellationToken::new()).await.expect("start");
    coord.run(RunParams::new("appns", "app-name", "test.app.image:latest")).await.expect("run");

    let ev = next(&mut rx).await;
    assert_eq!(ev.ty, EventType::New);
    assert_eq!(ev.namespace, "appns");
    assert_eq!(ev.host_ip, "192.168.176.128");
    assert_eq!(ev.pod_ip, "172.17.0.8");
    assert_eq!(ev.phase, "Running");
    assert!(ev.running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_subscriber_sees_events_in_order_until_unsubscribed() {
    let mc = Arc::new(MemoryCluster::new());
    let coord = coordinator(&mc);
    let (tx, mut rx) = unbounded_channel();
    let first = tx.clone();
    let second = tx.clone();
    coord
        .on_pod_event(move |e| { let _ = first.send(format!("a:{}", e.name)); })
        .on_pod_event(move |e| { let _ = second.send(format!("b:{}", e.name)); });
    let id = coord.subscribe_pods(move |e| { let _ = tx.send(format!("c:{}", e.name)); });
    coord.start(CancellationToken::new()).await.expect("start");

    mc.upsert(&ResourceKind::pods(), pod("p1", "ns")).await.expect("upsert");
    assert_eq!(next(&mut rx).await, "a:p1");
    assert_eq!(next(&mut rx).await, "b:p1");
    assert_eq!(next(&mut rx).await, "c:p1");

    assert!(coord.unsubscribe(id));
    mc.upsert(&ResourceKind::pods(), pod("p2", "ns")).await.expect("upsert");
    assert_eq!(next(&mut rx).await, "a:p2");
    assert_eq!(next(&mut rx).await, "b:p2");
    quiet(&mut rx).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_objects_are_cached_and_announced() {
    let mc = Arc::new(MemoryCluster::new());
    mc.upsert(&ResourceKind::pods(), pod("early", "ns")).await.expect("upsert");
    let coord = coordinator(&mc);
    let (tx, mut rx) = unbounded_channel();
    coord.on_pod_event(move |e| { let _ = tx.send(e.clone()); });
    coord.start(CancellationToken::new()).await.expect("start");

    let cached = coord.cached(&ResourceKind::pods(), "ns", "early").expect("cached");
    assert_eq!(cached.name(), "early");
    assert!(coord.cached(&ResourceKind::pods(), "other", "early").is_none());
    assert!(coord.cached(&ResourceKind::new("batch", "v1", "Job", "jobs"), "ns", "early").is_none());

    let ev = next(&mut rx).await;
    assert_eq!((ev.ty, ev.name.as_str()), (EventType::New, "early"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_failures_are_returned_not_retried() {
    let mc = Arc::new(MemoryCluster::new());
    let coord = coordinator(&mc);
    coord.start(CancellationToken::new()).await.expect("start");

    coord.run(RunParams::new("appns", "dup", "img")).await.expect("first");
    match coord.run(RunParams::new("appns", "dup", "img")).await {
        Err(CoordError::Remote(ClientError::AlreadyExists { name })) => assert_eq!(name, "dup"),
        other => panic!("expected conflict, got {:?}", other),
    }
    assert!(coord.run(RunParams::new("appns", "", "img")).await.unwrap_err().is_validation());
    assert_eq!(mc.create_calls(), 2);

    let fetched = coord.get(&ResourceKind::deployments(), "appns", "dup").await.expect("get");
    assert_eq!(fetched.nested(&["metadata", "labels", "coordinator"]).and_then(|v| v.as_str()), Some("coord-nginx"));
    assert!(matches!(
        coord.get(&ResourceKind::deployments(), "appns", "missing").await,
        Err(CoordError::Remote(ClientError::NotFound { .. }))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_then_drain_stops_cleanly() {
    let mc = Arc::new(MemoryCluster::new());
    let coord = coordinator(&mc);
    let (tx, mut rx) = unbounded_channel();
    coord.on_coord_event(move |e| { let _ = tx.send(*e); });
    let (dtx, mut drx) = unbounded_channel();
    coord.on_deployment_event(move |e| { let _ = dtx.send(e.clone()); });

    let cancel = CancellationToken::new();
    coord.start(cancel.clone()).await.expect("start");
    assert_eq!(next(&mut rx).await, CoordEvent::Started);

    cancel.cancel();
    assert!(matches!(coord.run(RunParams::new("ns", "late", "img")).await, Err(CoordError::NotStarted)));
    assert!(coord.drain(Duration::from_secs(1)).await);
    assert_eq!(next(&mut rx).await, CoordEvent::Stopped);
    assert_eq!(coord.phase(), Phase::Stopped);

    mc.upsert(&ResourceKind::deployments(), pod("ignored", "ns")).await.expect("upsert");
    quiet(&mut drx).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_namespace_limits_events_and_cache() {
    let mc = Arc::new(MemoryCluster::new());
    mc.upsert(&ResourceKind::pods(), pod("early", "b")).await.expect("upsert");
    let mut cfg = CoordConfig::new("c");
    cfg.watch_namespace = Some("a".into());
    let coord = Coordinator::with_backends(cfg, mc.clone(), mc.clone());
    let (tx, mut rx) = unbounded_channel();
    coord.on_pod_event(move |e| { let _ = tx.send(format!("{}/{}", e.namespace, e.name)); });
    coord.start(CancellationToken::new()).await.expect("start");

    mc.upsert(&ResourceKind::pods(), pod("p", "b")).await.expect("upsert");
    mc.upsert(&ResourceKind::pods(), pod("q", "a")).await.expect("upsert");
    assert_eq!(next(&mut rx).await, "a/q");
    quiet(&mut rx).await;

    assert!(coord.cached(&ResourceKind::pods(), "a", "q").is_some());
    assert!(coord.cached(&ResourceKind::pods(), "b", "p").is_none());
    assert!(coord.cached(&ResourceKind::pods(), "b", "early").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_stops_the_mirrors_too() {
    let mc = Arc::new(MemoryCluster::new());
    let coord = coordinator(&mc);
    coord.start(CancellationToken::new()).await.expect("start");
    mc.upsert(&ResourceKind::pods(), pod("before", "ns")).await.expect("upsert");
    tokio::time::timeout(WAIT, async {
        while coord.cached(&ResourceKind::pods(), "ns", "before").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("mirrored");

    assert!(coord.drain(Duration::from_secs(1)).await);
    mc.upsert(&ResourceKind::pods(), pod("after", "ns")).await.expect("upsert");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(coord.cached(&ResourceKind::pods(), "ns", "after").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_deployment_subscriber_does_not_hold_back_pods() {
    let mc = Arc::new(MemoryCluster::new());
    let coord = coordinator(&mc);
    coord.on_deployment_event(|_| std::thread::sleep(Duration::from_millis(1500)));
    let (tx, mut rx) = unbounded_channel();
    coord.on_pod_event(move |e| { let _ = tx.send(e.name.clone()); });
    coord.start(CancellationToken::new()).await.expect("start");

    mc.upsert(&ResourceKind::deployments(), deployment("slow", "ns")).await.expect("upsert");
    tokio::time::sleep(Duration::from_millis(50)).await;
    mc.upsert(&ResourceKind::pods(), pod("p", "ns")).await.expect("upsert");

    let got = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert_eq!(got.ok().flatten().as_deref(), Some("p"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_during_start_wins() {
    let mc = Arc::new(MemoryCluster::new());
    mc.withhold_sync(&ResourceKind::pods());
    let coord = coordinator(&mc);
    let (tx, mut rx) = unbounded_channel();
    coord.on_coord_event(move |e| { let _ = tx.send(*e); });

    let starting = tokio::spawn({
        let coord = coord.clone();
        async move { coord.start(CancellationToken::new()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coord.phase(), Phase::Starting);
    assert!(coord.drain(Duration::from_secs(1)).await);

    let res = tokio::time::timeout(WAIT, starting).await.expect("start returns").expect("join");
    assert!(res.is_err());
    assert_eq!(coord.phase(), Phase::Stopped);
    quiet(&mut rx).await;
}
