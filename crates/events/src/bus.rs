//! Ordered subscriber lists per event category.
//!
//! Lists are swapped atomically, so subscribing or unsubscribing while events
//! are being delivered is safe: a delivery in flight sees the list as it was
//! when the delivery began.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use horizon_core::{CoordEvent, DeploymentEvent, DomainEvent, PodEvent};
use tracing::error;

pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub struct Subscribers<E> {
    list: ArcSwap<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self { Self { list: ArcSwap::from_pointee(Vec::new()) } }
}

impl<E> Subscribers<E> {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.list.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn add(&self, id: SubscriptionId, cb: Callback<E>) {
        self.list.rcu(|cur| {
            let mut next = Vec::with_capacity(cur.len() + 1);
            next.extend(cur.iter().cloned());
            next.push((id, Arc::clone(&cb)));
            next
        });
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.list.rcu(|cur| {
            let next: Vec<_> = cur.iter().filter(|(i, _)| *i != id).cloned().collect();
            removed = next.len() != cur.len();
            next
        });
        removed
    }

    /// Invoke every subscriber in registration order; returns how many ran to completion.
    /// A panicking subscriber is logged and skipped.
    pub fn emit(&self, category: &str, ev: &E) -> usize {
        let subs = self.list.load_full();
        let mut delivered = 0;
        for (id, cb) in subs.iter() {
            match catch_unwind(AssertUnwindSafe(|| cb(ev))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(category, subscription = ?id, "subscriber panicked"),
            }
        }
        delivered
    }
}

/// Subscriber lists for all event categories.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    pub coord: Subscribers<CoordEvent>,
    pub deployments: Subscribers<DeploymentEvent>,
    pub pods: Subscribers<PodEvent>,
}

impl EventBus {
    pub fn new() -> Self { Self::default() }

    fn next_id(&self) -> SubscriptionId { SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed)) }

    pub fn on_coord(&self, f: impl Fn(&CoordEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id();
        self.coord.add(id, Arc::new(f));
        id
    }

    pub fn on_deployment(&self, f: impl Fn(&DeploymentEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id();
        self.deployments.add(id, Arc::new(f));
        id
    }

    pub fn on_pod(&self, f: impl Fn(&PodEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id();
        self.pods.add(id, Arc::new(f));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.coord.remove(id) || self.deployments.remove(id) || self.pods.remove(id)
    }

    /// Deliver a domain event to its category; events with no subscribers are dropped.
    pub fn publish(&self, ev: &DomainEvent) -> usize {
        match ev {
            DomainEvent::Deployment(e) => self.deployments.emit("deployment", e),
            DomainEvent::Pod(e) => self.pods.emit("pod", e),
        }
    }

    pub fn publish_coord(&self, ev: CoordEvent) -> usize { self.coord.emit("coord", &ev) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            bus.on_coord(move |ev| seen.lock().unwrap().push(format!("{}:{:?}", tag, ev)));
        }
        assert_eq!(bus.publish_coord(CoordEvent::Started), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["a:Started", "b:Started", "c:Started"]);
    }

    #[test]
    fn unsubscribe_removes_only_that_subscriber() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h1 = hits.clone();
        let first = bus.on_coord(move |_| { h1.fetch_add(1, Ordering::SeqCst); });
        let h2 = hits.clone();
        bus.on_coord(move |_| { h2.fetch_add(10, Ordering::SeqCst); });

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        bus.publish_coord(CoordEvent::Stopped);
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(bus.coord.len(), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        bus.on_coord(|_| panic!("boom"));
        let h = hits.clone();
        bus.on_coord(move |_| { h.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(bus.publish_coord(CoordEvent::Started), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_without_subscribers_are_dropped() {
        let bus = EventBus::new();
        let ev = DomainEvent::Pod(PodEvent {
            ty: horizon_core::EventType::New,
            name: "p".into(),
            namespace: "ns".into(),
            host_ip: "unknown".into(),
            pod_ip: "unknown".into(),
            phase: "unknown".into(),
            running: false,
        });
        assert_eq!(bus.publish(&ev), 0);
    }

    #[test]
    fn subscribing_from_inside_a_callback_takes_effect_next_time() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicU64::new(0));
        let inner_bus = bus.clone();
        let inner_hits = hits.clone();
        bus.on_coord(move |_| {
            let h = inner_hits.clone();
            inner_bus.on_coord(move |_| { h.fetch_add(1, Ordering::SeqCst); });
        });
        assert_eq!(bus.publish_coord(CoordEvent::Started), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.publish_coord(CoordEvent::Started);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
