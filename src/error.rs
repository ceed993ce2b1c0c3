// Error taxonomy for the appliance
//
// Components recover transient faults locally with bounded retries and
// surface only what the operator must act on. Every variant carries a
// stable `kind` string that the HTTP layer and UI tests key off; the
// kind → status mapping in `http_status` is the single authoritative
// table for the API surface.

use thiserror::Error;

/// Errors that cross component boundaries.
#[derive(Debug, Error)]
pub enum Error {
    /// Input malformed or a precondition violated. Never retried.
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid credentials.
    #[error("{0}")]
    Unauthorized(String),

    /// Credentials valid but the operation is not allowed.
    #[error("{0}")]
    Forbidden(String),

    /// Addressed resource absent.
    #[error("{0}")]
    NotFound(String),

    /// Underlying disk or database fault. Retried up to 3x before surfacing.
    #[error("storage fault: {0}")]
    Storage(String),

    /// Timeouts, 5xx, 408/429. Retried with exponential backoff + jitter.
    #[error("transient network fault: {0}")]
    TransientNetwork(String),

    /// Non-retriable 4xx from the remote aggregator. Disables the sync job.
    #[error("protocol error: {0}")]
    PermanentProtocol(String),

    /// Invalid configuration at load time. The process refuses to start.
    #[error("invalid configuration ({}): {message}", keys.join(", "))]
    Configuration { keys: Vec<String>, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable kind string, usable by UI tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::Unauthorized(_) | Error::Forbidden(_) => "AuthError",
            Error::NotFound(_) => "NotFoundError",
            Error::Storage(_) => "StorageError",
            Error::TransientNetwork(_) => "TransientNetworkError",
            Error::PermanentProtocol(_) => "PermanentProtocolError",
            Error::Configuration { .. } => "ConfigurationError",
        }
    }

    /// The authoritative error → HTTP status mapping.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 422,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Storage(_) => 500,
            Error::TransientNetwork(_) => 502,
            Error::PermanentProtocol(_) => 502,
            Error::Configuration { .. } => 400,
        }
    }

    /// Whether a bounded retry may clear this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::TransientNetwork(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            // Constraint violations are caller bugs, not disk faults
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Validation(err.to_string())
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Error::TransientNetwork(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() => {
                Error::TransientNetwork(err.to_string())
            }
            Some(status) if status.as_u16() == 408 || status.as_u16() == 429 => {
                Error::TransientNetwork(err.to_string())
            }
            Some(_) => Error::PermanentProtocol(err.to_string()),
            None => Error::TransientNetwork(err.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
