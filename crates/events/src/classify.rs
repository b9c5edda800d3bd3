use horizon_core::{DomainEvent, EventType, Notification, WatchedKind};
use tracing::trace;

use crate::detect::{detect, Change};
use crate::project::{projector_for, StatusProjector};

/// Turns mirror notifications for one watched kind into domain events.
pub struct Classifier {
    label: String,
    projector: Box<dyn StatusProjector>,
}

impl Classifier {
    pub fn new(kind: &WatchedKind) -> Self {
        Self { label: kind.resource.gvr_key(), projector: projector_for(kind.category) }
    }

    pub fn label(&self) -> &str { &self.label }

    /// At most one event per notification; updates carrying a seen version token yield none.
    pub fn classify(&self, n: &Notification) -> Option<DomainEvent> {
        let ev = match n {
            Notification::Added(obj) => self.projector.event(EventType::New, obj),
            Notification::Updated { old, new } => match detect(old, new) {
                Change::Significant => self.projector.event(EventType::Updated, new),
                Change::Replay => {
                    metrics::counter!("horizon_events_suppressed_total", 1u64, "kind" => self.label.clone());
                    trace!(kind = %self.label, object = %new.key(), "replayed update suppressed");
                    return None;
                }
                Change::Undetermined => {
                    metrics::counter!("horizon_change_undetermined_total", 1u64, "kind" => self.label.clone());
                    return None;
                }
            },
            Notification::Deleted(obj) => self.projector.event(EventType::Deleted, obj),
        };
        metrics::counter!("horizon_events_emitted_total", 1u64, "kind" => self.label.clone());
        Some(ev)
    }
}
