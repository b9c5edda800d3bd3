//! Horizon events: raw notifications in, typed lifecycle events out.
//!
//! - [`detect`] decides whether an update carries a new version token.
//! - [`project`] pulls derived status (readiness, phase, addresses) out of raw objects.
//! - [`classify`] combines both into at most one [`DomainEvent`] per notification.
//! - [`bus`] fans events out to ordered subscriber lists.
//!
//! [`DomainEvent`]: horizon_core::DomainEvent

#![forbid(unsafe_code)]

pub mod bus;
pub mod classify;
pub mod detect;
pub mod project;

pub use bus::{EventBus, SubscriptionId, Subscribers};
pub use classify::Classifier;
pub use detect::{detect, Change};
pub use project::{projector_for, DeploymentStatus, Field, PodStatus, StatusProjector};
