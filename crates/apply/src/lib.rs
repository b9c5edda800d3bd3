//! Horizon apply: validate run requests, render deployment manifests, submit each one once.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use horizon_core::{CoordError, RawObject, ResourceKind, RunParams};
use horizon_kubehub::ResourceClient;
use metrics::{counter, histogram};
use serde_json::{json, Map, Value as Json};
use tracing::{info, warn};

pub const DEFAULT_PULL_POLICY: &str = "IfNotPresent";

/// Fail on the first missing required field.
pub fn validate(params: &RunParams) -> Result<(), CoordError> {
    if params.name.is_empty() {
        return Err(CoordError::MissingField("name"));
    }
    if params.image.is_empty() {
        return Err(CoordError::MissingField("image"));
    }
    Ok(())
}

pub fn with_defaults(mut params: RunParams) -> RunParams {
    if params.replicas == 0 {
        params.replicas = 1;
    }
    params
}

/// Labels marking an object as owned by `coordinator`.
pub fn managed_labels(coordinator: &str, app: &str) -> Map<String, Json> {
    let mut m = Map::new();
    m.insert("app".into(), Json::String(app.to_string()));
    m.insert("coordinated".into(), Json::String("true".into()));
    m.insert("coordinator".into(), Json::String(coordinator.to_string()));
    m
}

/// Render the deployment for already validated and defaulted parameters.
pub fn render_deployment(coordinator: &str, kind: &ResourceKind, params: &RunParams) -> RawObject {
    let managed = managed_labels(coordinator, &params.name);
    let mut labels = Map::new();
    for (k, v) in params.label_pairs() {
        labels.insert(k, Json::String(v));
    }
    // managed keys win over caller labels
    labels.extend(managed.clone());

    let pull_policy = if params.image_pull_policy.is_empty() { DEFAULT_PULL_POLICY } else { params.image_pull_policy.as_str() };
    let mut container = json!({
        "name": params.name,
        "image": params.image,
        "imagePullPolicy": pull_policy,
    });
    if params.port > 0 {
        container["ports"] = json!([{ "containerPort": params.port }]);
    }
    let env: Vec<Json> = params.env_pairs().into_iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
    if !env.is_empty() {
        container["env"] = Json::Array(env);
    }

    RawObject::new(json!({
        "apiVersion": kind.api_version(),
        "kind": kind.kind,
        "metadata": {
            "name": params.name,
            "namespace": params.namespace,
            "labels": labels,
        },
        "spec": {
            "replicas": params.replicas,
            "selector": { "matchLabels": managed },
            "template": {
                "metadata": { "labels": labels },
                "spec": { "containers": [container] },
            },
        },
    }))
}

pub fn to_yaml(obj: &RawObject) -> Result<String> {
    serde_yaml::to_string(obj.as_json()).context("rendering manifest as YAML")
}

/// Builds and submits workload manifests for one coordinator.
#[derive(Clone)]
pub struct Synthesizer {
    coordinator: String,
    kind: ResourceKind,
    client: Arc<dyn ResourceClient>,
}

impl Synthesizer {
    pub fn new(coordinator: &str, kind: ResourceKind, client: Arc<dyn ResourceClient>) -> Self {
        Self { coordinator: coordinator.to_string(), kind, client }
    }

    /// Validate, default and render without contacting the cluster.
    pub fn prepare(&self, params: RunParams) -> Result<(RunParams, RawObject), CoordError> {
        validate(&params)?;
        let params = with_defaults(params);
        let manifest = render_deployment(&self.coordinator, &self.kind, &params);
        Ok((params, manifest))
    }

    /// One create call; the client's error is returned as is, never retried.
    pub async fn run(&self, params: RunParams) -> Result<RawObject, CoordError> {
        let t0 = Instant::now();
        counter!("horizon_run_attempts_total", 1u64);
        let (params, manifest) = match self.prepare(params) {
            Ok(v) => v,
            Err(e) => {
                counter!("horizon_run_err_total", 1u64, "reason" => "validation");
                return Err(e);
            }
        };
        info!(ns = %params.namespace, name = %params.name, image = %params.image, replicas = params.replicas, "run: creating deployment");
        let res = self.client.create(&self.kind, &params.namespace, &manifest).await;
        histogram!("horizon_run_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(created) => {
                counter!("horizon_run_ok_total", 1u64);
                info!(name = %created.name(), rv = ?created.resource_version(), took_ms = %t0.elapsed().as_millis(), "run: created");
                Ok(created)
            }
            Err(e) => {
                counter!("horizon_run_err_total", 1u64, "reason" => "remote");
                warn!(name = %params.name, error = %e, "run: create failed");
                Err(CoordError::Remote(e))
            }
        }
    }
}
