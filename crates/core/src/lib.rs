//! Horizon core types: watched kinds, raw objects, notifications and domain events.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod error;
mod params;

pub use error::{ClientError, CoordError};
pub use params::RunParams;

/// A watched resource kind, addressed the way the API server serves it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name (e.g. `deployments`).
    pub plural: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), plural: plural.to_string() }
    }

    pub fn deployments() -> Self { Self::new("apps", "v1", "Deployment", "deployments") }

    pub fn pods() -> Self { Self::new("", "v1", "Pod", "pods") }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `v1/Pod` or `apps/v1/Deployment`.
    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }

    /// `v1/pods` or `apps/v1/deployments`.
    pub fn gvr_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.plural)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvr_key())
    }
}

/// Which domain event family a watched kind feeds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Category {
    Deployment,
    Pod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchedKind {
    pub resource: ResourceKind,
    pub category: Category,
}

impl WatchedKind {
    pub fn deployments() -> Self { Self { resource: ResourceKind::deployments(), category: Category::Deployment } }
    pub fn pods() -> Self { Self { resource: ResourceKind::pods(), category: Category::Pod } }
}

/// Identity of an object within one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() { f.write_str(&self.name) } else { write!(f, "{}/{}", self.namespace, self.name) }
    }
}

/// Schema-less object as delivered by the watch source. Never mutated by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RawObject(pub Json);

impl RawObject {
    pub fn new(v: Json) -> Self { Self(v) }

    pub fn as_json(&self) -> &Json { &self.0 }

    pub fn into_json(self) -> Json { self.0 }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn name(&self) -> &str { self.meta_str("name").unwrap_or("") }

    pub fn namespace(&self) -> &str { self.meta_str("namespace").unwrap_or("") }

    pub fn uid(&self) -> Option<&str> { self.meta_str("uid") }

    /// The version token used for change detection, when present and a string.
    pub fn resource_version(&self) -> Option<&str> { self.meta_str("resourceVersion") }

    pub fn kind(&self) -> Option<&str> { self.0.get("kind").and_then(|v| v.as_str()) }

    pub fn api_version(&self) -> Option<&str> { self.0.get("apiVersion").and_then(|v| v.as_str()) }

    pub fn key(&self) -> ObjectKey {
        ObjectKey { namespace: self.namespace().to_string(), name: self.name().to_string() }
    }

    /// Walk nested object fields; `None` when any segment is absent or not an object.
    pub fn nested(&self, path: &[&str]) -> Option<&Json> {
        let mut cur = &self.0;
        for seg in path {
            cur = cur.as_object()?.get(*seg)?;
        }
        Some(cur)
    }
}

impl From<Json> for RawObject {
    fn from(v: Json) -> Self { Self(v) }
}

/// Raw watcher output for one kind.
#[derive(Debug, Clone)]
pub enum Delta {
    Applied(RawObject),
    Deleted(RawObject),
    /// Full listing; the first one marks the initial sync.
    Relisted(Vec<RawObject>),
}

/// Add/update/delete notification produced by the local mirror.
#[derive(Debug, Clone)]
pub enum Notification {
    Added(RawObject),
    Updated { old: RawObject, new: RawObject },
    Deleted(RawObject),
}

impl Notification {
    pub fn object(&self) -> &RawObject {
        match self {
            Notification::Added(o) | Notification::Deleted(o) => o,
            Notification::Updated { new, .. } => new,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    New,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CoordEvent {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub ty: EventType,
    pub name: String,
    pub namespace: String,
    /// Requested replica count from status (0 when unreadable).
    pub replicas: i64,
    pub ready_replicas: i64,
    pub ready: bool,
    /// Compact JSON of the status section, when present.
    pub status: Option<String>,
    pub source: RawObject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodEvent {
    pub ty: EventType,
    pub name: String,
    pub namespace: String,
    pub host_ip: String,
    pub pod_ip: String,
    pub phase: String,
    pub running: bool,
}

#[derive(Debug, Clone)]
pub enum DomainEvent {
    Deployment(DeploymentEvent),
    Pod(PodEvent),
}

impl DomainEvent {
    pub fn ty(&self) -> EventType {
        match self {
            DomainEvent::Deployment(e) => e.ty,
            DomainEvent::Pod(e) => e.ty,
        }
    }
}

pub mod prelude {
    pub use super::{
        Category, ClientError, CoordError, CoordEvent, Delta, DeploymentEvent, DomainEvent, EventType, Notification,
        ObjectKey, PodEvent, RawObject, ResourceKind, RunParams, WatchedKind,
    };
}
