use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Request to create one workload. Only `name` and `image` are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunParams {
    pub namespace: String,
    pub name: String,
    pub image: String,
    /// Empty means the default (`IfNotPresent`).
    pub image_pull_policy: String,
    /// Container port; 0 means none.
    pub port: i64,
    /// `KEY=VALUE` entries.
    pub envs: Vec<String>,
    /// Comma separated `key=value` list.
    pub labels: String,
    /// 0 means the default of 1.
    pub replicas: i64,
}

impl RunParams {
    pub fn new(namespace: &str, name: &str, image: &str) -> Self {
        Self { namespace: namespace.to_string(), name: name.to_string(), image: image.to_string(), ..Default::default() }
    }

    pub fn label_pairs(&self) -> SmallVec<[(String, String); 8]> {
        self.labels
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(split_pair)
            .collect()
    }

    pub fn env_pairs(&self) -> SmallVec<[(String, String); 8]> {
        self.envs.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).map(split_pair).collect()
    }
}

fn split_pair(s: &str) -> (String, String) {
    match s.split_once('=') {
        Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
        None => (s.to_string(), String::new()),
    }
}
