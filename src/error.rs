//! Error types for the stream engine.

use std::sync::Arc;

/// Misuse of a stream's public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// `write()` was called on a sink after `end()`
    #[error("write after end")]
    WriteAfterEnd,

    /// `end()` was called on a sink more than once
    #[error("end() called more than once")]
    EndCalledTwice,

    /// A producer pushed a chunk after signalling end-of-data
    #[error("push after end-of-data")]
    PushAfterEnd,

    /// A refill returned without pushing a chunk or signalling end-of-data
    #[error("refill returned without producing data")]
    EmptyRefill,
}

/// The main error type for the stream engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A source's refill callback failed to produce data
    #[error("Production error: {0}")]
    Production(Arc<dyn std::error::Error + Send + Sync>),

    /// A sink's drain callback signalled failure
    #[error("Consumption error: {0}")]
    Consumption(Arc<dyn std::error::Error + Send + Sync>),

    /// A stream was used against its contract
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// The stream was destroyed and accepts no further operations
    #[error("Stream was destroyed")]
    Destroyed,

    /// A stream closed before it ended or finished
    #[error("Stream closed prematurely")]
    PrematureClose,

    /// Construction parameters were rejected
    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(String),

    /// A channel was closed unexpectedly
    #[error("Channel was closed unexpectedly")]
    ChannelClosed,

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create a production error from any error type
    pub fn production<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Production(Arc::new(error))
    }

    /// Create a consumption error from any error type
    pub fn consumption<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Consumption(Arc::new(error))
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Classify this error as coming from a producer, unless it already carries a category.
    pub fn into_production(self) -> Self {
        match self {
            Error::Custom(_) | Error::ChannelClosed => Error::Production(Arc::new(self)),
            other => other,
        }
    }

    /// Classify this error as coming from a consumer, unless it already carries a category.
    pub fn into_consumption(self) -> Self {
        match self {
            Error::Custom(_) | Error::ChannelClosed => Error::Consumption(Arc::new(self)),
            other => other,
        }
    }
}

// Common conversions
impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::sync::AcquireError> for Error {
    fn from(_: tokio::sync::AcquireError) -> Self {
        Error::ChannelClosed
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Error::Custom(e.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait for converting foreign errors into our Error type
pub trait IntoError<T> {
    fn into_production_error(self) -> Result<T>;
    fn into_consumption_error(self) -> Result<T>;
}

impl<T, E> IntoError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_production_error(self) -> Result<T> {
        self.map_err(Error::production)
    }

    fn into_consumption_error(self) -> Result<T> {
        self.map_err(Error::consumption)
    }
}
