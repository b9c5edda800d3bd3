//! Derived status facts pulled from the `status` section of raw objects.

use horizon_core::{Category, DeploymentEvent, DomainEvent, EventType, PodEvent, RawObject};
use tracing::{debug, warn};

/// Sentinel for string fields that could not be read.
pub const UNKNOWN: &str = "unknown";

/// Result of a nested field lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    Present(T),
    Missing,
    TypeMismatch,
}

impl<T> Field<T> {
    pub fn present(self) -> Option<T> {
        match self {
            Field::Present(v) => Some(v),
            _ => None,
        }
    }

    /// Resolve to `sentinel` when the field is not usable, reporting why.
    pub fn or_sentinel(self, sentinel: T, field: &'static str, obj: &RawObject) -> T {
        match self {
            Field::Present(v) => v,
            Field::Missing => {
                metrics::counter!("horizon_projection_warnings_total", 1u64, "field" => field, "reason" => "missing");
                debug!(object = %obj.key(), field, "status field missing; using sentinel");
                sentinel
            }
            Field::TypeMismatch => {
                metrics::counter!("horizon_projection_warnings_total", 1u64, "field" => field, "reason" => "type");
                warn!(object = %obj.key(), field, "status field has unexpected type; using sentinel");
                sentinel
            }
        }
    }
}

pub fn status_i64(obj: &RawObject, field: &str) -> Field<i64> {
    match obj.nested(&["status", field]) {
        None => Field::Missing,
        Some(v) => v.as_i64().map_or(Field::TypeMismatch, Field::Present),
    }
}

pub fn status_str(obj: &RawObject, field: &str) -> Field<String> {
    match obj.nested(&["status", field]) {
        None => Field::Missing,
        Some(v) => v.as_str().map_or(Field::TypeMismatch, |s| Field::Present(s.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub replicas: i64,
    pub ready_replicas: i64,
    pub ready: bool,
    pub raw: Option<String>,
}

impl DeploymentStatus {
    /// Ready when ready replicas equal requested replicas. An unreadable requested
    /// count is 0, so a deployment with no status at all reports ready.
    pub fn project(obj: &RawObject) -> Self {
        let replicas = status_i64(obj, "replicas").or_sentinel(0, "status.replicas", obj);
        let ready_replicas = status_i64(obj, "readyReplicas").or_sentinel(0, "status.readyReplicas", obj);
        let raw = obj.nested(&["status"]).and_then(|s| serde_json::to_string(s).ok());
        Self { replicas, ready_replicas, ready: ready_replicas == replicas, raw }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatus {
    pub phase: String,
    pub host_ip: String,
    pub pod_ip: String,
    pub running: bool,
}

impl PodStatus {
    pub fn project(obj: &RawObject) -> Self {
        let phase = status_str(obj, "phase").or_sentinel(UNKNOWN.to_string(), "status.phase", obj);
        let host_ip = status_str(obj, "hostIP").or_sentinel(UNKNOWN.to_string(), "status.hostIP", obj);
        let pod_ip = status_str(obj, "podIP").or_sentinel(UNKNOWN.to_string(), "status.podIP", obj);
        let running = phase == "Running";
        Self { phase, host_ip, pod_ip, running }
    }
}

/// Builds the typed event for one watched kind.
pub trait StatusProjector: Send + Sync {
    fn event(&self, ty: EventType, obj: &RawObject) -> DomainEvent;
}

pub struct DeploymentProjector;

impl StatusProjector for DeploymentProjector {
    fn event(&self, ty: EventType, obj: &RawObject) -> DomainEvent {
        let st = DeploymentStatus::project(obj);
        DomainEvent::Deployment(DeploymentEvent {
            ty,
            name: obj.name().to_string(),
            namespace: obj.namespace().to_string(),
            replicas: st.replicas,
            ready_replicas: st.ready_replicas,
            ready: st.ready,
            status: st.raw,
            source: obj.clone(),
        })
    }
}

pub struct PodProjector;

impl StatusProjector for PodProjector {
    fn event(&self, ty: EventType, obj: &RawObject) -> DomainEvent {
        let st = PodStatus::project(obj);
        DomainEvent::Pod(PodEvent {
            ty,
            name: obj.name().to_string(),
            namespace: obj.namespace().to_string(),
            host_ip: st.host_ip,
            pod_ip: st.pod_ip,
            phase: st.phase,
            running: st.running,
        })
    }
}

pub fn projector_for(category: Category) -> Box<dyn StatusProjector> {
    match category {
        Category::Deployment => Box::new(DeploymentProjector),
        Category::Pod => Box::new(PodProjector),
    }
}
