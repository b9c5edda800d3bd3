//! Horizon store: per-kind local mirror.
//!
//! The mirror consumes raw watcher deltas, keeps the last observed object per
//! `(namespace, name)`, and turns each delta into `Added`, `Updated(old, new)`
//! or `Deleted` notifications. The first full listing flips the synced flag.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use horizon_core::{Delta, Notification, ObjectKey, RawObject};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const MAX_BATCH: usize = 256;

/// Last observed state of every object of one kind.
#[derive(Default)]
pub struct Mirror {
    objects: FxHashMap<ObjectKey, RawObject>,
    synced: bool,
    epoch: u64,
}

impl Mirror {
    pub fn new() -> Self { Self::default() }

    pub fn is_synced(&self) -> bool { self.synced }

    pub fn len(&self) -> usize { self.objects.len() }

    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn get(&self, key: &ObjectKey) -> Option<&RawObject> { self.objects.get(key) }

    /// Fold one delta into the mirror and return the notifications it implies, in delivery order.
    pub fn apply(&mut self, delta: Delta) -> Vec<Notification> {
        self.epoch = self.epoch.saturating_add(1);
        match delta {
            Delta::Applied(new) => {
                let out = match self.objects.insert(new.key(), new.clone()) {
                    Some(old) => Notification::Updated { old, new },
                    None => Notification::Added(new),
                };
                vec![out]
            }
            Delta::Deleted(obj) => {
                self.objects.remove(&obj.key());
                vec![Notification::Deleted(obj)]
            }
            Delta::Relisted(list) => {
                let mut out = Vec::with_capacity(list.len());
                let mut next: FxHashMap<ObjectKey, RawObject> = FxHashMap::default();
                for new in list {
                    let key = new.key();
                    match self.objects.remove(&key) {
                        Some(old) => out.push(Notification::Updated { old, new: new.clone() }),
                        None => out.push(Notification::Added(new.clone())),
                    }
                    next.insert(key, new);
                }
                // Whatever is left vanished while we were not watching
                let mut gone: Vec<_> = std::mem::take(&mut self.objects).into_iter().collect();
                gone.sort_by(|a, b| a.0.cmp(&b.0));
                out.extend(gone.into_iter().map(|(_, o)| Notification::Deleted(o)));
                self.objects = next;
                self.synced = true;
                out
            }
        }
    }

    pub fn freeze(&self) -> Arc<MirrorSnapshot> {
        Arc::new(MirrorSnapshot { epoch: self.epoch, synced: self.synced, items: self.objects.clone() })
    }
}

/// Immutable view of a mirror at some epoch.
#[derive(Debug, Clone, Default)]
pub struct MirrorSnapshot {
    pub epoch: u64,
    pub synced: bool,
    pub items: FxHashMap<ObjectKey, RawObject>,
}

/// Read side of a running mirror.
#[derive(Clone)]
pub struct MirrorHandle {
    snap: Arc<ArcSwap<MirrorSnapshot>>,
    synced_rx: watch::Receiver<bool>,
}

impl MirrorHandle {
    pub fn current(&self) -> Arc<MirrorSnapshot> { self.snap.load_full() }

    pub fn get(&self, namespace: &str, name: &str) -> Option<RawObject> {
        let key = ObjectKey { namespace: namespace.to_string(), name: name.to_string() };
        self.snap.load().items.get(&key).cloned()
    }

    /// Flips to `true` once the initial listing has been applied.
    pub fn synced(&self) -> watch::Receiver<bool> { self.synced_rx.clone() }
}

/// Spawn the mirror loop for one kind. Returns the delta sender for the watch source,
/// the ordered notification stream, a read handle, and the loop's task. The loop ends
/// once every delta sender is dropped.
pub fn spawn_mirror(
    label: String,
    cap: usize,
) -> (mpsc::Sender<Delta>, mpsc::Receiver<Notification>, MirrorHandle, JoinHandle<()>) {
    let cap = cap.max(1);
    let (delta_tx, mut delta_rx) = mpsc::channel::<Delta>(cap);
    let (notif_tx, notif_rx) = mpsc::channel::<Notification>(cap);
    let (synced_tx, synced_rx) = watch::channel(false);
    let snap = Arc::new(ArcSwap::from_pointee(MirrorSnapshot::default()));
    let snap_clone = Arc::clone(&snap);

    let task = tokio::spawn(async move {
        let t0 = Instant::now();
        let mut mirror = Mirror::new();
        while let Some(first) = delta_rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match delta_rx.try_recv() {
                    Ok(d) => batch.push(d),
                    Err(_) => break,
                }
            }
            let was_synced = mirror.is_synced();
            let mut out = Vec::new();
            for d in batch {
                out.extend(mirror.apply(d));
            }
            snap_clone.store(mirror.freeze());
            if !was_synced && mirror.is_synced() {
                metrics::histogram!("horizon_sync_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => label.clone());
                info!(kind = %label, objects = mirror.len(), took_ms = %t0.elapsed().as_millis(), "cache synced");
                let _ = synced_tx.send(true);
            }
            for n in out {
                if notif_tx.send(n).await.is_err() {
                    debug!(kind = %label, "notification receiver dropped");
                    break;
                }
            }
        }
        info!(kind = %label, "mirror loop stopped");
    });

    (delta_tx, notif_rx, MirrorHandle { snap, synced_rx }, task)
}
