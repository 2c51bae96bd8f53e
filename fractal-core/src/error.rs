//! Error types for the replication engine.

use thiserror::Error;

/// Errors returned by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// A singleton resource (room alias, link) already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The acting account is already a member of the room.
    #[error("already in room: {0}")]
    AlreadyJoined(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transport request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Whether the error means the requested resource is already in place.
    pub fn is_already_present(&self) -> bool {
        matches!(
            self,
            TransportError::AlreadyExists(_) | TransportError::AlreadyJoined(_)
        )
    }
}

/// Errors returned by a [`Store`](crate::store::Store).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors surfaced by planning, running and replicating.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A parent resource or credentials are not realized yet.
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),
    #[error("authentication required: {0}")]
    AuthenticationRequired(String),
    /// Planning bug: bad link or missing plan metadata.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ReplicationError {
    pub fn missing(what: impl Into<String>) -> Self {
        ReplicationError::MissingPrerequisite(what.into())
    }

    pub fn config(what: impl Into<String>) -> Self {
        ReplicationError::Configuration(what.into())
    }

    /// Authentication and configuration problems never heal by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Transport(TransportError::Unauthorized(_)) => false,
            ReplicationError::Transport(_)
            | ReplicationError::Store(_)
            | ReplicationError::MissingPrerequisite(_) => true,
            ReplicationError::AuthenticationRequired(_)
            | ReplicationError::Configuration(_)
            | ReplicationError::Serialization(_)
            | ReplicationError::RetriesExhausted { .. } => false,
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        ReplicationError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
