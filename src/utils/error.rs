//! Crate-wide error type.
//!
//! Synchronous calls return these directly. Asynchronous operations hand the
//! same variants to their registered listener exactly once.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The component is not started, already terminated, or the service is not connected.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("publisher buffer full (capacity {capacity})")]
    PublisherOverflow { capacity: usize },

    #[error("publish rejected by broker: {0}")]
    PublishRejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The service was interrupted while the call was pending.
    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("invalid selector '{expression}': {reason}")]
    InvalidSelector { expression: String, reason: String },

    #[error("missing resource: {0}")]
    MissingResource(String),

    #[error("queue '{0}' is full")]
    QueueFull(String),

    /// The broker refused a request for a reason without a dedicated variant.
    #[error("broker error: {0}")]
    Broker(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] sled::Error),

    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    /// Whether a connection attempt that failed with this error may be retried.
    ///
    /// Bad credentials will not get better by trying again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Authentication(_) | Error::Config(_))
    }
}
