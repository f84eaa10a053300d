//! Error types for the trail_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for trail_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred outside the durable store
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The durable store medium failed; callers retry with backoff
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// `put` found an existing item under the same key
    #[error("Duplicate key {key:?} in collection {collection:?}")]
    DuplicateKey { collection: String, key: String },

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Collection {collection:?} has no index {index:?}")]
    UnknownIndex { collection: String, index: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Location or heart-rate permission was revoked; fatal for the session
    #[error("Sensor permission denied: {0}")]
    SensorPermissionDenied(String),

    /// Sensor temporarily unable to produce a reading
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Sensor timed out")]
    SensorTimeout,

    /// Malformed heart-rate notification frame
    #[error("Malformed heart-rate frame: {0}")]
    Frame(String),

    /// In-memory point buffer exceeded its cap while the store was failing
    #[error("Point buffer overflow (capacity {capacity})")]
    BufferOverflow { capacity: usize },

    /// Remote authority rejected or could not be reached
    #[error("Sync failed: {0}")]
    SyncFailed(String),

    /// Sync operation exhausted its retry budget
    #[error("Sync operation {id} errored after {attempts} attempts")]
    SyncErrored { id: String, attempts: u32 },

    /// Session lifecycle operation not valid in the current state
    #[error("Cannot {action} a session that is {state}")]
    InvalidTransition { state: String, action: &'static str },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller should retry the operation later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::SensorUnavailable(_)
                | Error::SensorTimeout
                | Error::SyncFailed(_)
        )
    }

    /// Wrap an IO failure on the store medium
    pub(crate) fn unavailable(context: impl std::fmt::Display, err: io::Error) -> Self {
        Error::StoreUnavailable(format!("{}: {}", context, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::StoreUnavailable("disk".into()).is_transient());
        assert!(Error::SensorTimeout.is_transient());
        assert!(Error::SyncFailed("503".into()).is_transient());
        assert!(!Error::SensorPermissionDenied("revoked".into()).is_transient());
        assert!(!Error::SyncErrored {
            id: "op".into(),
            attempts: 8
        }
        .is_transient());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = Error::InvalidTransition {
            state: "completed".into(),
            action: "resume",
        };
        assert_eq!(err.to_string(), "Cannot resume a session that is completed");
    }
}
