use crate::types::BusinessId;
use thiserror::Error;

/// Downstream collaborator named in timeout and inconsistency errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Store,
    Index,
    Cache,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Store => write!(f, "store"),
            Component::Index => write!(f, "index"),
            Component::Cache => write!(f, "cache"),
        }
    }
}

/// Error types for the proximity engine
#[derive(Debug, Error)]
pub enum ProximityError {
    /// Input rejected before reaching the store
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// No record with this id in the store
    #[error("business not found: {0}")]
    NotFound(BusinessId),

    /// Optimistic update lost the race against a newer version
    #[error("version conflict for {id}: expected {expected}, current {actual}")]
    VersionConflict {
        id: BusinessId,
        expected: u64,
        actual: u64,
    },

    /// A downstream call exceeded its deadline
    #[error("{component} call timed out")]
    DownstreamTimeout { component: Component },

    /// Index or cache fell behind the store after a successful write
    #[error("{component} inconsistent for {id}: {detail}")]
    Inconsistent {
        id: BusinessId,
        component: Component,
        detail: String,
    },

    /// Admission queue is full
    #[error("service overloaded")]
    Overloaded,

    /// Store has been closed
    #[error("store is closed")]
    Closed,

    /// A reconciliation run is already in progress
    #[error("a reconciliation run is already in progress")]
    ReconcileInProgress,

    /// Lock acquisition failed (poisoned)
    #[error("failed to acquire {0} lock")]
    Lock(&'static str),

    /// Invalid geohash or bucket computation
    #[error("invalid geohash: {0}")]
    InvalidGeohash(String),

    /// Unexpected end of file during log replay
    #[error("unexpected end of file")]
    UnexpectedEof,

    /// I/O error from the persistence layer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error with context
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProximityError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        ProximityError::Validation {
            field,
            message: message.into(),
        }
    }

    /// Prefix a validation message with the batch position it came from
    pub fn at_item(self, position: usize) -> Self {
        match self {
            ProximityError::Validation { field, message } => ProximityError::Validation {
                field,
                message: format!("item {}: {}", position, message),
            },
            other => other,
        }
    }

    /// Whether a retry has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProximityError::DownstreamTimeout { .. }
                | ProximityError::Lock(_)
                | ProximityError::Io(_)
        )
    }
}

impl From<bincode::Error> for ProximityError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                ProximityError::UnexpectedEof
            }
            other => ProximityError::Serialization(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProximityError {
    fn from(err: serde_json::Error) -> Self {
        ProximityError::Serialization(err.to_string())
    }
}

/// Result type alias for proximity operations
pub type Result<T> = std::result::Result<T, ProximityError>;
