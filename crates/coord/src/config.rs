use std::str::FromStr;
use std::time::Duration;

use horizon_core::{Category, ResourceKind, WatchedKind};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_QUEUE_CAP: usize = 1024;
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Everything a coordinator needs besides its backends.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// Coordinator name; stamped on created objects as the `coordinator` label.
    pub name: String,
    /// Default namespace of the resource client. Replaces the kubeconfig context namespace
    /// when connecting, so it is `"default"` unless set.
    pub namespace: String,
    /// Restrict watches to one namespace; `None` watches all.
    pub watch_namespace: Option<String>,
    pub kinds: Vec<WatchedKind>,
    /// Capacity of each per-kind queue.
    pub queue_cap: usize,
    /// Give up on the initial sync after this long, in addition to cancellation.
    pub sync_timeout: Option<Duration>,
    pub drain_grace: Duration,
}

impl CoordConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            watch_namespace: None,
            kinds: vec![WatchedKind::deployments(), WatchedKind::pods()],
            queue_cap: DEFAULT_QUEUE_CAP,
            sync_timeout: None,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Defaults overridden by `HORIZON_*` environment variables; unparsable values are ignored.
    pub fn from_env(name: &str) -> Self {
        Self::from_lookup(name, |k| std::env::var(k).ok())
    }

    pub fn from_lookup(name: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: FromStr>(v: Option<String>) -> Option<T> { v.and_then(|s| s.trim().parse().ok()) }

        let mut cfg = Self::new(name);
        if let Some(ns) = lookup("HORIZON_NAMESPACE").filter(|s| !s.is_empty()) {
            cfg.namespace = ns;
        }
        cfg.watch_namespace = lookup("HORIZON_WATCH_NAMESPACE").filter(|s| !s.is_empty());
        if let Some(cap) = parse::<usize>(lookup("HORIZON_QUEUE_CAP")).filter(|c| *c > 0) {
            cfg.queue_cap = cap;
        }
        cfg.sync_timeout = parse::<u64>(lookup("HORIZON_SYNC_TIMEOUT_SECS")).map(Duration::from_secs);
        if let Some(ms) = parse::<u64>(lookup("HORIZON_DRAIN_GRACE_MS")) {
            cfg.drain_grace = Duration::from_millis(ms);
        }
        cfg
    }

    /// Kind that `run` creates: the first watched deployment kind.
    pub fn workload_kind(&self) -> ResourceKind {
        self.kinds
            .iter()
            .find(|k| k.category == Category::Deployment)
            .map(|k| k.resource.clone())
            .unwrap_or_else(ResourceKind::deployments)
    }
}
