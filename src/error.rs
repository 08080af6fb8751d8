use thiserror::Error;

/// Classified failures from the provider access layer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Provider signaled over-quota (HTTP 429). Triggers endpoint cooldown.
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    /// Provider-side failure (HTTP 5xx). Triggers rotation + backoff.
    #[error("provider server error: {0}")]
    TransientServer(String),

    /// Structured-output schema rejected by the provider.
    #[error("invalid response schema: {0}")]
    SchemaInvalid(String),

    /// Every endpoint exceeded its retry budget.
    #[error("all endpoints exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    /// Classify an HTTP status into the retry taxonomy.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ClientError::RateLimited(body)
        } else if status.is_server_error() {
            ClientError::TransientServer(body)
        } else {
            ClientError::Other(anyhow::anyhow!("provider error ({}): {}", status, body))
        }
    }

    /// Rate limits and transient server errors are worth another attempt on a
    /// rotated endpoint; schema and other errors are not fixed by retrying.
    #[allow(dead_code)]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::RateLimited(_) | ClientError::TransientServer(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        let e = ClientError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "quota".into());
        assert!(matches!(e, ClientError::RateLimited(_)));
        assert!(e.is_retryable());

        let e = ClientError::from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "down".into());
        assert!(matches!(e, ClientError::TransientServer(_)));
        assert!(e.is_retryable());

        let e = ClientError::from_status(reqwest::StatusCode::BAD_REQUEST, "nope".into());
        assert!(matches!(e, ClientError::Other(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_exhausted_not_retryable() {
        assert!(!ClientError::Exhausted { attempts: 12 }.is_retryable());
    }
}
