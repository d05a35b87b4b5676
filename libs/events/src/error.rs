//! Error types for the shared vocabulary.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A persisted or received status string is not recognised.
    #[error("unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    /// The task payload is invalid.
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::InvalidPayload(err.to_string())
    }
}
