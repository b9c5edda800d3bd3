use horizon_core::RawObject;
use tracing::warn;

/// Outcome of comparing two observations of the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Version tokens differ.
    Significant,
    /// Same version token: a resend of state already seen.
    Replay,
    /// A version token could not be read from one side; nothing is emitted.
    Undetermined,
}

impl Change {
    pub fn is_significant(self) -> bool { matches!(self, Change::Significant) }
}

/// Compare `resourceVersion` tokens as opaque strings.
pub fn detect(old: &RawObject, new: &RawObject) -> Change {
    match (old.resource_version(), new.resource_version()) {
        (Some(a), Some(b)) if a == b => Change::Replay,
        (Some(_), Some(_)) => Change::Significant,
        (a, b) => {
            warn!(
                object = %new.key(),
                old_rv = ?a,
                new_rv = ?b,
                "cannot read resourceVersion; update not emitted"
            );
            Change::Undetermined
        }
    }
}
