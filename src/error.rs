use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the PostHog SDK.
///
/// Evaluation never fails with one of these for normal business outcomes (a disabled flag, no
/// matching condition, a condition that can't be decided locally). They surface I/O, server and
/// configuration problems.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The server rejected our credentials (401/403). Not recoverable by retrying.
    #[error("unauthorized, api_key or personal_api_key is likely invalid")]
    Unauthorized,

    /// The project is over its quota (402/429) for the requested resource.
    #[error("quota limited")]
    QuotaLimited,

    /// Any other non-success response from the server.
    #[error("api error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error detail returned by the server, or the raw body.
        message: String,
    },

    /// Invalid host configuration.
    #[error("invalid host configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Client configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,

    /// A delivery worker thread panicked. This should normally never happen.
    #[error("delivery worker thread panicked")]
    WorkerThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Error serializing or deserializing a payload.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    /// Error talking to the Redis cache backend.
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(Arc<redis::RedisError>),
}

impl Error {
    /// Return `true` if retrying the same request may succeed.
    ///
    /// Client errors other than rate limiting are considered permanent.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            Error::Api { status, .. } => !(400..500).contains(status) || *status == 429,
            Error::QuotaLimited => true,
            Error::Network(_) | Error::Io(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(value: redis::RedisError) -> Self {
        Error::Redis(Arc::new(value))
    }
}

/// Reasons an event could not be accepted for delivery.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The delivery queue is at capacity. The event was not queued.
    #[error("delivery queue is full")]
    QueueFull,

    /// The client has been shut down and no longer accepts events.
    #[error("client is shut down")]
    ShutDown,
}
