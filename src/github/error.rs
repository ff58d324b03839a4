use thiserror::Error;

/// Classified outcome of a failed search call
///
/// Every transport or protocol failure maps to exactly one of these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// Bad or expired credential; retrying will not help
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Quota exhausted; retryable after the window resets
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network failure or server-side error; retryable with backoff
    #[error("transient failure: {0}")]
    Transient(String),

    /// Response failed schema validation
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl QueryError {
    /// Returns true for failures that may succeed if tried again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }

    /// Short stable name used in logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited(_) => "rate_limited",
            Self::Transient(_) => "transient",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Classifies a transport-level reqwest failure
pub fn classify_transport_error(error: &reqwest::Error) -> QueryError {
    if error.is_builder() {
        QueryError::Malformed(format!("invalid request: {}", error))
    } else if error.is_timeout() {
        QueryError::Transient("request timeout".to_string())
    } else if error.is_connect() {
        QueryError::Transient(format!("connection failed: {}", error))
    } else {
        QueryError::Transient(error.to_string())
    }
}
