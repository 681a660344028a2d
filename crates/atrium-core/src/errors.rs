use std::time::Duration;

/// Failure of a call to the completion capability. The brain retries the
/// transient kinds once per turn and surfaces the rest to the caller.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion endpoint rejected credentials: {0}")]
    AuthenticationFailed(String),
    #[error("completion request rejected: {0}")]
    InvalidRequest(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl CompletionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
                | Self::Timeout(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Map a non-success status from the completion endpoint.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(CompletionError::RateLimited { retry_after: None }.is_retryable());
        assert!(CompletionError::ServerError { status: 502, body: "bad gateway".into() }.is_retryable());
        assert!(CompletionError::NetworkError("reset".into()).is_retryable());
        assert!(CompletionError::Timeout(Duration::from_secs(5)).is_retryable());
    }

    #[test]
    fn rejected_requests_are_not_retried() {
        assert!(!CompletionError::AuthenticationFailed("bad key".into()).is_retryable());
        assert!(!CompletionError::InvalidRequest("bad".into()).is_retryable());
        assert!(!CompletionError::Cancelled.is_retryable());
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(CompletionError::from_status(401, "no".into()), CompletionError::AuthenticationFailed(_)));
        assert!(CompletionError::from_status(429, String::new()).is_retryable());
        assert!(CompletionError::from_status(503, "down".into()).is_retryable());
        let odd = CompletionError::from_status(418, "teapot".into());
        assert_eq!(odd.error_kind(), "invalid_request");
        assert!(odd.to_string().contains("418"));
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = CompletionError::RateLimited { retry_after: Some(Duration::from_secs(2)) };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(2)));
        assert_eq!(CompletionError::Cancelled.suggested_delay(), None);
    }
}
