//! Event error type.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A wire name outside the `blueprint.*` vocabulary.
    #[error("unknown blueprint event type '{0}'")]
    UnknownEventType(String),

    #[error("event encoding failed: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}
