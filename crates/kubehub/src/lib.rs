//! Horizon kubehub: watch source and resource client wiring over kube-rs.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use horizon_core::{ClientError, CoordError, Delta, RawObject, ResourceKind};
use kube::{
    api::{Api, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod memory;

pub use memory::MemoryCluster;

/// Per-kind list+watch feed.
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// List and watch `kind`, pushing deltas into `tx` until `cancel` fires or `tx` closes.
    /// The first `Delta::Relisted` carries the initial full listing.
    async fn watch(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        tx: mpsc::Sender<Delta>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Read/write access to cluster objects. Every call is attempted once.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn create(&self, kind: &ResourceKind, namespace: &str, manifest: &RawObject) -> Result<RawObject, ClientError>;
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<RawObject, ClientError>;
}

/// Load client configuration from an explicit kubeconfig, or infer it (in-cluster, then local kubeconfig).
pub async fn load_config(kubeconfig: Option<&str>) -> Result<Config, CoordError> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .map_err(|e| CoordError::Configuration(format!("reading kubeconfig {}: {}", path, e)))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .map_err(|e| CoordError::Configuration(format!("loading kubeconfig {}: {}", path, e)))
        }
        None => Config::infer().await.map_err(|e| CoordError::Configuration(e.to_string())),
    }
}

/// kube-rs backed watch source and resource client.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
    default_ns: String,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        let default_ns = client.default_namespace().to_string();
        Self { client, default_ns }
    }

    /// Build a client from configuration; `namespace` overrides the config's default namespace.
    pub async fn connect(kubeconfig: Option<&str>, namespace: Option<&str>) -> Result<Self, CoordError> {
        let mut cfg = load_config(kubeconfig).await?;
        if let Some(ns) = namespace.filter(|s| !s.is_empty()) {
            cfg.default_namespace = ns.to_string();
        }
        let client = Client::try_from(cfg).map_err(|e| CoordError::Configuration(e.to_string()))?;
        info!(ns = %client.default_namespace(), "kube client ready");
        Ok(Self::new(client))
    }

    pub fn default_namespace(&self) -> &str { &self.default_ns }

    fn resolve_ns<'a>(&'a self, namespace: &'a str) -> &'a str {
        if namespace.is_empty() { &self.default_ns } else { namespace }
    }

    async fn api_for(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = if kind.plural.is_empty() {
            find_api_resource(self.client.clone(), kind).await?
        } else {
            (api_resource(kind), true)
        };
        let api = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api)
    }
}

/// ApiResource for a kind whose plural is known up front.
pub fn api_resource(kind: &ResourceKind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
    ApiResource::from_gvk_with_plural(&gvk, &kind.plural)
}

async fn find_api_resource(client: Client, kind: &ResourceKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == kind.group && ar.version == kind.version && ar.kind == kind.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}", kind.gvk_key()))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn raw_from(obj: &DynamicObject) -> Result<RawObject> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(RawObject::new(raw))
}

/// Map a kube error into the client error taxonomy; `name` identifies the target object.
pub fn client_error(e: kube::Error, name: &str) -> ClientError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => ClientError::AlreadyExists { name: name.to_string() },
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound { name: name.to_string() },
        kube::Error::Api(ae) => ClientError::Api { code: ae.code, message: ae.message },
        other => ClientError::Transport(other.to_string()),
    }
}

#[async_trait]
impl WatchSource for KubeHub {
    async fn watch(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        tx: mpsc::Sender<Delta>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let api = self.api_for(&kind, namespace.as_deref()).await?;
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(kind = %kind, ns = ?namespace, "watcher started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(kind = %kind, "watcher cancelled");
                    break;
                }
                next = stream.next() => next,
            };
            let delta = match next {
                Some(Ok(Event::Applied(o))) => Delta::Applied(raw_from(&o)?),
                Some(Ok(Event::Deleted(o))) => Delta::Deleted(raw_from(&o)?),
                Some(Ok(Event::Restarted(list))) => {
                    debug!(kind = %kind, count = list.len(), "watch restart");
                    Delta::Relisted(list.iter().map(raw_from).collect::<Result<Vec<_>>>()?)
                }
                Some(Err(e)) => {
                    metrics::counter!("horizon_watch_errors_total", 1u64, "kind" => kind.gvr_key());
                    warn!(kind = %kind, error = %e, "watch stream error");
                    continue;
                }
                None => {
                    warn!(kind = %kind, "watcher stream ended");
                    break;
                }
            };
            if tx.send(delta).await.is_err() {
                debug!(kind = %kind, "delta receiver dropped; stopping watcher");
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceClient for KubeHub {
    async fn create(&self, kind: &ResourceKind, namespace: &str, manifest: &RawObject) -> Result<RawObject, ClientError> {
        let ns = self.resolve_ns(namespace);
        let name = manifest.name().to_string();
        let api = self.api_for(kind, Some(ns)).await.map_err(|e| ClientError::Transport(e.to_string()))?;
        let obj: DynamicObject =
            serde_json::from_value(manifest.as_json().clone()).map_err(|e| ClientError::Decode(e.to_string()))?;
        let created = api.create(&PostParams::default(), &obj).await.map_err(|e| client_error(e, &name))?;
        debug!(kind = %kind, ns = %ns, name = %name, rv = ?created.metadata.resource_version, "object created");
        raw_from(&created).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<RawObject, ClientError> {
        let ns = self.resolve_ns(namespace);
        let api = self.api_for(kind, Some(ns)).await.map_err(|e| ClientError::Transport(e.to_string()))?;
        let obj = api.get(name).await.map_err(|e| client_error(e, name))?;
        raw_from(&obj).map_err(|e| ClientError::Decode(e.to_string()))
    }
}
