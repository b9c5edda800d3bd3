//! Horizon coordinator: mirrors watched kinds, waits for the initial sync,
//! delivers classified events to subscribers and creates workloads on request.
//!
//! Each watched kind runs three tasks connected by bounded queues: the watch
//! source feeding deltas, the mirror turning them into notifications, and a
//! delivery task classifying notifications and invoking subscribers. Delivery
//! for one kind is sequential; different kinds are delivered concurrently.

#![forbid(unsafe_code)]

pub mod barrier;
pub mod config;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use horizon_apply::Synthesizer;
use horizon_core::{CoordError, CoordEvent, DeploymentEvent, PodEvent, RawObject, ResourceKind, RunParams};
use horizon_events::{Classifier, EventBus, SubscriptionId};
use horizon_kubehub::{KubeHub, ResourceClient, WatchSource};
use horizon_store::{spawn_mirror, MirrorHandle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use barrier::wait_for_sync;
pub use config::CoordConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Started,
    Failed,
    Stopped,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoordConfig,
    source: Arc<dyn WatchSource>,
    client: Arc<dyn ResourceClient>,
    synth: Synthesizer,
    bus: Arc<EventBus>,
    state: Mutex<State>,
}

struct State {
    phase: Phase,
    token: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    mirrors: HashMap<String, MirrorHandle>,
}

impl Coordinator {
    /// Coordinator backed by a live cluster.
    pub async fn connect(config: CoordConfig, kubeconfig: Option<&str>) -> Result<Self, CoordError> {
        let hub = Arc::new(KubeHub::connect(kubeconfig, Some(&config.namespace)).await?);
        Ok(Self::with_backends(config, hub.clone(), hub))
    }

    pub fn with_backends(config: CoordConfig, source: Arc<dyn WatchSource>, client: Arc<dyn ResourceClient>) -> Self {
        let synth = Synthesizer::new(&config.name, config.workload_kind(), client.clone());
        let state = State { phase: Phase::Idle, token: None, tasks: Vec::new(), mirrors: HashMap::new() };
        Self {
            inner: Arc::new(Inner { config, source, client, synth, bus: Arc::new(EventBus::new()), state: Mutex::new(state) }),
        }
    }

    pub fn config(&self) -> &CoordConfig { &self.inner.config }

    pub fn name(&self) -> &str { &self.inner.config.name }

    pub fn phase(&self) -> Phase { self.lock().phase }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Begin watching every configured kind and block until all report synced.
    ///
    /// Fires `CoordEvent::Started` on success. On failure the watches are torn
    /// down and the coordinator cannot be started again.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), CoordError> {
        let token = cancel.child_token();
        {
            let mut st = self.lock();
            if st.phase != Phase::Idle {
                return Err(CoordError::AlreadyStarted);
            }
            st.phase = Phase::Starting;
            st.token = Some(token.clone());
        }

        let cfg = &self.inner.config;
        info!(name = %cfg.name, kinds = cfg.kinds.len(), ns = ?cfg.watch_namespace, "coordinator starting");
        let mut waits = Vec::with_capacity(cfg.kinds.len());
        let mut tasks = Vec::with_capacity(cfg.kinds.len() * 3);
        let mut mirrors = HashMap::new();
        for wk in &cfg.kinds {
            let label = wk.resource.gvr_key();
            let (delta_tx, notif_rx, handle, mirror_task) = spawn_mirror(label.clone(), cfg.queue_cap);
            waits.push((label.clone(), handle.synced()));
            mirrors.insert(label, handle);
            tasks.push(mirror_task);

            let source = self.inner.source.clone();
            let kind = wk.resource.clone();
            let ns = cfg.watch_namespace.clone();
            let watch_token = token.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = source.watch(kind.clone(), ns, delta_tx, watch_token).await {
                    error!(kind = %kind, error = %e, "watch source failed");
                }
            }));
            tasks.push(spawn_delivery(Classifier::new(wk), notif_rx, self.inner.bus.clone(), token.clone()));
        }
        {
            let mut st = self.lock();
            st.tasks = tasks;
            st.mirrors = mirrors;
        }

        let synced = wait_for_sync(waits, &token, cfg.sync_timeout).await;
        // a drain while waiting has already moved the phase on; keep it
        let still_starting = {
            let mut st = self.lock();
            let starting = st.phase == Phase::Starting;
            if starting {
                st.phase = if synced.is_ok() { Phase::Started } else { Phase::Failed };
            }
            starting
        };
        if let Err(e) = synced {
            token.cancel();
            error!(name = %cfg.name, error = %e, "coordinator failed to start");
            return Err(e);
        }
        if !still_starting {
            warn!(name = %cfg.name, "coordinator stopped before it finished starting");
            return Err(CoordError::NotStarted);
        }
        info!(name = %cfg.name, "coordinator started");
        self.inner.bus.publish_coord(CoordEvent::Started);
        Ok(())
    }

    /// Create one workload deployment from `params`.
    pub async fn run(&self, params: RunParams) -> Result<(), CoordError> {
        if !self.is_running() {
            return Err(CoordError::NotStarted);
        }
        self.inner.synth.run(params).await.map(|_| ())
    }

    fn is_running(&self) -> bool {
        let st = self.lock();
        st.phase == Phase::Started && st.token.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Fetch an object straight from the cluster, bypassing the mirror.
    pub async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<RawObject, CoordError> {
        Ok(self.inner.client.get(kind, namespace, name).await?)
    }

    /// Last mirrored state of an object, if its kind is watched and the object is known.
    pub fn cached(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<RawObject> {
        self.lock().mirrors.get(&kind.gvr_key()).and_then(|m| m.get(namespace, name))
    }

    pub fn on_coord_event(&self, f: impl Fn(&CoordEvent) + Send + Sync + 'static) -> &Self {
        self.inner.bus.on_coord(f);
        self
    }

    pub fn on_deployment_event(&self, f: impl Fn(&DeploymentEvent) + Send + Sync + 'static) -> &Self {
        self.inner.bus.on_deployment(f);
        self
    }

    pub fn on_pod_event(&self, f: impl Fn(&PodEvent) + Send + Sync + 'static) -> &Self {
        self.inner.bus.on_pod(f);
        self
    }

    pub fn subscribe_coord(&self, f: impl Fn(&CoordEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.bus.on_coord(f)
    }

    pub fn subscribe_deployments(&self, f: impl Fn(&DeploymentEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.bus.on_deployment(f)
    }

    pub fn subscribe_pods(&self, f: impl Fn(&PodEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.bus.on_pod(f)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool { self.inner.bus.unsubscribe(id) }

    /// Stop all watches and wait up to `grace` for the tasks to finish; stragglers are aborted.
    /// Returns whether everything stopped within the grace period. Fires `CoordEvent::Stopped`
    /// if the coordinator had started.
    pub async fn drain(&self, grace: Duration) -> bool {
        let (tasks, token) = {
            let mut st = self.lock();
            (std::mem::take(&mut st.tasks), st.token.clone())
        };
        if let Some(t) = &token {
            t.cancel();
        }
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let clean = tokio::time::timeout(grace, futures::future::join_all(tasks)).await.is_ok();
        if !clean {
            warn!(name = %self.name(), grace_ms = %grace.as_millis(), "drain grace elapsed; aborting tasks");
            for a in aborts {
                a.abort();
            }
        }
        let was_started = {
            let mut st = self.lock();
            let prev = st.phase;
            st.phase = Phase::Stopped;
            prev == Phase::Started
        };
        if was_started {
            self.inner.bus.publish_coord(CoordEvent::Stopped);
        }
        info!(name = %self.name(), clean, "coordinator stopped");
        clean
    }
}

fn spawn_delivery(
    classifier: Classifier,
    mut rx: mpsc::Receiver<horizon_core::Notification>,
    bus: Arc<EventBus>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let n = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                n = rx.recv() => match n {
                    Some(n) => n,
                    None => break,
                },
            };
            if let Some(ev) = classifier.classify(&n) {
                bus.publish(&ev);
            }
        }
        debug!(kind = %classifier.label(), "delivery stopped");
    })
}
