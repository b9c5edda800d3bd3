use serde::{Deserialize, Serialize};

/// Errors reported by a resource client (create/get).
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientError {
    #[error("already exists: {name}")]
    AlreadyExists { name: String },
    #[error("not found: {name}")]
    NotFound { name: String },
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

/// Coordinator-level errors surfaced to callers of `start`/`run`.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("failed to sync resource {kind}")]
    SyncTimeout { kind: String },
    #[error("validation: missing {0}")]
    MissingField(&'static str),
    #[error("remote: {0}")]
    Remote(#[from] ClientError),
    #[error("coordinator not started")]
    NotStarted,
    #[error("coordinator already started")]
    AlreadyStarted,
}

impl CoordError {
    pub fn is_validation(&self) -> bool { matches!(self, CoordError::MissingField(_)) }
}
