//! Error types for remote-service calls.

use thiserror::Error;

/// Errors that can occur when calling the remote microblogging service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Transport-level failure: DNS, connect, TLS, timeout.
    #[error("network error: {0}")]
    Network(String),

    /// The service throttled the request.
    #[error("rate limited by remote service")]
    RateLimited,

    /// Credentials were rejected. This is the auth-revocation signal: a
    /// connected session receiving it is torn down.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The response body did not match the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Any other non-success HTTP status.
    #[error("api error (status {status}): {message}")]
    Status { status: u16, message: String },
}

impl ApiError {
    /// Whether this error signals revoked or rejected credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Malformed(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

/// Convenience type alias for remote-call results.
pub type ApiResult<T> = Result<T, ApiError>;
