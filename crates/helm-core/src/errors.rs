use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by a provider adapter.
///
/// The split that matters downstream is [`ProviderError::is_retryable`] vs
/// [`ProviderError::is_fatal`]: retryable failures are retried inside the
/// adapter layer with backoff, fatal failures surface immediately.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("provider overloaded")]
    Overloaded,

    #[error("network error: {0}")]
    Network(String),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("context window exceeded: {used} tokens > {limit} limit")]
    ContextWindowExceeded { used: u64, limit: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether the adapter layer should retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Overloaded
                | Self::Network(_)
                | Self::StreamInterrupted(_)
        )
    }

    /// Fatal errors surface to the caller without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_)
                | Self::ContextWindowExceeded { .. }
                | Self::InvalidRequest(_)
        )
    }

    /// Delay hint for retry scheduling, when the provider gave one.
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::Overloaded => Some(Duration::from_secs(10)),
            _ => None,
        }
    }

    /// Stable machine-readable kind string for events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::Network(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::ContextWindowExceeded { .. } => "context_window_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status from any provider into the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::AuthenticationFailed(message),
            400 => Self::InvalidRequest(message),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            s if s >= 500 => Self::ServerError { status: s, message },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::Overloaded.is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(ProviderError::StreamInterrupted("idle".into()).is_retryable());
        assert!(!ProviderError::AuthenticationFailed("bad key".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(ProviderError::AuthenticationFailed("x".into()).is_fatal());
        assert!(ProviderError::InvalidRequest("x".into()).is_fatal());
        assert!(ProviderError::ContextWindowExceeded { used: 10, limit: 5 }.is_fatal());
        assert!(!ProviderError::Overloaded.is_fatal());
        // Timeout and Cancelled are operational: neither retried nor fatal.
        assert!(!ProviderError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!ProviderError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            ProviderError::from_status(401, "no"),
            ProviderError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            ProviderError::from_status(400, "bad"),
            ProviderError::InvalidRequest(_)
        ));
        assert!(matches!(
            ProviderError::from_status(429, ""),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(ProviderError::from_status(529, ""), ProviderError::Overloaded));
        assert!(matches!(
            ProviderError::from_status(503, "down"),
            ProviderError::ServerError { status: 503, .. }
        ));
    }

    #[test]
    fn suggested_delay_from_retry_after() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.suggested_delay(), Some(Duration::from_secs(7)));
        assert_eq!(ProviderError::Network("x".into()).suggested_delay(), None);
    }
}
