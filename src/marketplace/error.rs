use crate::marketplace::auth::AuthError;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("credential unavailable: {0}")]
    Auth(#[from] AuthError),
    #[error("rate limited by marketplace")]
    RateLimited { retry_after: Option<Duration> },
    #[error("marketplace unavailable after {attempts} attempts: {detail}")]
    TransientServer { attempts: u32, detail: String },
    #[error("HTTP {status}: {body}")]
    PermanentClient { status: StatusCode, body: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed marketplace payload: {0}")]
    Decode(String),
}

impl RequestError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RequestError::RateLimited { .. })
    }

    /// Errors worth trying again on a later cycle without counting as a failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RequestError::RateLimited { .. }
                | RequestError::TransientServer { .. }
                | RequestError::Timeout(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RequestError::NotFound(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            RequestError::Unauthorized(_) | RequestError::Auth(AuthError::Rejected(_))
        )
    }
}
