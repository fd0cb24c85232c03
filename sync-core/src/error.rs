use thiserror::Error;

/// The error taxonomy shared by the client and server halves of the engine.
///
/// `Duplicate` and `RateLimit` are not really "errors" from the caller's
/// perspective — the push pipeline treats the former as success and the
/// circuit breaker treats the latter as a signal, not a failure to surface.
/// They live in this enum anyway so every fallible call in the crate can
/// return one `Result` type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("entity already exists")]
    Duplicate,

    #[error("rate limited")]
    RateLimit,

    #[error("server error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("not found")]
    NotFound,

    #[error("health check failed")]
    HealthCheckFailed,

    #[error("local store error: {0}")]
    Store(String),

    #[error("invalid id: {0}")]
    InvalidId(#[from] uuid::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
