//! Error taxonomy for the governed streaming pipeline.

use thiserror::Error;

/// Errors surfaced by engines, stores, and the orchestrator.
///
/// Budget exhaustion is not an error: it ends the stream with an
/// `execution_ended` event.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("handshake timed out: {0}")]
    Timeout(String),
    #[error("io error: {0}")]
    Io(String),
    #[error(
        "stream exceeded overall timeout of {timeout_seconds}s after {events_delivered} events"
    )]
    DeadlineExceeded {
        timeout_seconds: u64,
        events_delivered: u64,
    },
    #[error("streaming failed after {attempts} attempts: {message}")]
    StreamingFailed { attempts: u32, message: String },
    #[error("engine error: {0}")]
    Engine(String),
    #[error("checkpoint store error: {0}")]
    Store(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl StreamError {
    /// Connection-establishment failures, the only class the handshake
    /// retries.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Convenience result type for pipeline operations.
pub type StreamResult<T> = Result<T, StreamError>;
