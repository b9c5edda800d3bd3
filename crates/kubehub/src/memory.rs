//! In-memory cluster standing in for both the watch source and the resource client.
//!
//! Objects get a `uid`, a monotonically increasing `resourceVersion` and a
//! `creationTimestamp` the way an API server would stamp them. Watchers receive
//! an initial `Relisted` followed by `Applied`/`Deleted` deltas.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use horizon_core::{ClientError, Delta, ObjectKey, RawObject, ResourceKind};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ResourceClient, WatchSource};

#[derive(Clone)]
struct Watcher {
    /// `None` watches every namespace.
    namespace: Option<String>,
    tx: mpsc::Sender<Delta>,
}

impl Watcher {
    fn sees(&self, obj: &RawObject) -> bool {
        self.namespace.as_deref().map_or(true, |ns| obj.namespace() == ns)
    }
}

#[derive(Default)]
struct KindState {
    objects: BTreeMap<ObjectKey, RawObject>,
    watchers: Vec<Watcher>,
    withheld: bool,
}

pub struct MemoryCluster {
    kinds: Mutex<HashMap<String, KindState>>,
    rv: AtomicU64,
    creates: AtomicUsize,
    default_ns: String,
}

impl Default for MemoryCluster {
    fn default() -> Self { Self::new() }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self { kinds: Mutex::new(HashMap::new()), rv: AtomicU64::new(0), creates: AtomicUsize::new(0), default_ns: "default".into() }
    }

    /// Never deliver the initial listing for `kind`, so it never reports synced.
    pub fn withhold_sync(&self, kind: &ResourceKind) {
        self.with_kind(kind, |st| st.withheld = true);
    }

    /// Number of `create` calls received, successful or not.
    pub fn create_calls(&self) -> usize { self.creates.load(Ordering::SeqCst) }

    pub fn len(&self, kind: &ResourceKind) -> usize { self.with_kind(kind, |st| st.objects.len()) }

    pub fn is_empty(&self, kind: &ResourceKind) -> bool { self.len(kind) == 0 }

    /// Insert or replace an object (e.g. a status change), bumping its version.
    pub async fn upsert(&self, kind: &ResourceKind, obj: RawObject) -> Result<RawObject, ClientError> {
        let mut json = obj.into_json();
        self.stamp(&mut json)?;
        let stored = RawObject::new(json);
        let watchers = self.with_kind(kind, |st| {
            st.objects.insert(stored.key(), stored.clone());
            st.watchers.clone()
        });
        broadcast(watchers, Delta::Applied(stored.clone())).await;
        Ok(stored)
    }

    /// Re-deliver the stored object unchanged, as a watch reconnect would.
    pub async fn replay(&self, kind: &ResourceKind, namespace: &str, name: &str) -> bool {
        let key = ObjectKey { namespace: namespace.to_string(), name: name.to_string() };
        let found = self.with_kind(kind, |st| st.objects.get(&key).cloned().map(|o| (o, st.watchers.clone())));
        match found {
            Some((obj, watchers)) => {
                broadcast(watchers, Delta::Applied(obj)).await;
                true
            }
            None => false,
        }
    }

    /// Send a full listing to every watcher of `kind`.
    pub async fn relist(&self, kind: &ResourceKind) {
        let (list, watchers) = self.with_kind(kind, |st| (st.objects.values().cloned().collect::<Vec<_>>(), st.watchers.clone()));
        broadcast(watchers, Delta::Relisted(list)).await;
    }

    pub async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<RawObject> {
        let key = ObjectKey { namespace: namespace.to_string(), name: name.to_string() };
        let removed = self.with_kind(kind, |st| st.objects.remove(&key).map(|o| (o, st.watchers.clone())));
        let (obj, watchers) = removed?;
        broadcast(watchers, Delta::Deleted(obj.clone())).await;
        Some(obj)
    }

    fn with_kind<R>(&self, kind: &ResourceKind, f: impl FnOnce(&mut KindState) -> R) -> R {
        let mut kinds = self.kinds.lock().unwrap_or_else(|p| p.into_inner());
        f(kinds.entry(kind.gvr_key()).or_default())
    }

    fn stamp(&self, json: &mut Json) -> Result<(), ClientError> {
        let meta = json
            .as_object_mut()
            .ok_or_else(|| ClientError::Decode("object is not a map".into()))?
            .entry("metadata")
            .or_insert_with(|| Json::Object(Default::default()))
            .as_object_mut()
            .ok_or_else(|| ClientError::Decode("metadata is not a map".into()))?;
        let rv = self.rv.fetch_add(1, Ordering::SeqCst) + 1;
        meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
        meta.entry("uid").or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
        meta.entry("creationTimestamp").or_insert_with(|| {
            Json::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        });
        Ok(())
    }
}

/// Deliver `delta` to every watcher whose namespace it falls in.
async fn broadcast(watchers: Vec<Watcher>, delta: Delta) {
    for w in watchers {
        if w.tx.is_closed() {
            continue;
        }
        let scoped = match &delta {
            Delta::Applied(o) | Delta::Deleted(o) if !w.sees(o) => continue,
            Delta::Relisted(list) => Delta::Relisted(list.iter().filter(|o| w.sees(o)).cloned().collect()),
            d => d.clone(),
        };
        let _ = w.tx.send(scoped).await;
    }
}

#[async_trait]
impl WatchSource for MemoryCluster {
    async fn watch(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        tx: mpsc::Sender<Delta>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let watcher = Watcher { namespace, tx: tx.clone() };
        let initial = self.with_kind(&kind, |st| {
            st.watchers.retain(|w| !w.tx.is_closed());
            st.watchers.push(watcher.clone());
            if st.withheld {
                None
            } else {
                Some(st.objects.values().filter(|o| watcher.sees(o)).cloned().collect::<Vec<_>>())
            }
        });
        match initial {
            Some(list) => {
                debug!(kind = %kind, count = list.len(), "memory watch listed");
                let _ = tx.send(Delta::Relisted(list)).await;
            }
            None => debug!(kind = %kind, "memory watch withholding initial listing"),
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tx.closed() => {}
        }
        // drop our sender so the consumer sees the end of the stream
        self.with_kind(&kind, |st| st.watchers.retain(|w| !w.tx.same_channel(&tx)));
        Ok(())
    }
}

#[async_trait]
impl ResourceClient for MemoryCluster {
    async fn create(&self, kind: &ResourceKind, namespace: &str, manifest: &RawObject) -> Result<RawObject, ClientError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let ns = if namespace.is_empty() { self.default_ns.as_str() } else { namespace };
        let name = manifest.name().to_string();
        if name.is_empty() {
            return Err(ClientError::Api { code: 422, message: "metadata.name is required".into() });
        }
        if !manifest.namespace().is_empty() && manifest.namespace() != ns {
            return Err(ClientError::Api {
                code: 400,
                message: "the namespace of the provided object does not match the namespace sent on the request".into(),
            });
        }
        let mut json = manifest.as_json().clone();
        if let Some(meta) = json.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".into(), Json::String(ns.to_string()));
        }
        self.stamp(&mut json)?;
        let stored = RawObject::new(json);
        let watchers = self.with_kind(kind, |st| {
            if st.objects.contains_key(&stored.key()) {
                return Err(ClientError::AlreadyExists { name: name.clone() });
            }
            st.objects.insert(stored.key(), stored.clone());
            Ok(st.watchers.clone())
        })?;
        broadcast(watchers, Delta::Applied(stored.clone())).await;
        Ok(stored)
    }

    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<RawObject, ClientError> {
        let ns = if namespace.is_empty() { self.default_ns.as_str() } else { namespace };
        let key = ObjectKey { namespace: ns.to_string(), name: name.to_string() };
        self.with_kind(kind, |st| st.objects.get(&key).cloned())
            .ok_or_else(|| ClientError::NotFound { name: name.to_string() })
    }
}
