use crate::http::build_client;
use crate::marketplace::config::MarketplaceConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing marketplace client credentials in env")]
    MissingCredentials,
    #[error("no credential stored for {0}")]
    NotConnected(String),
    #[error("connection for {0} is broken and needs to be re-authorized")]
    ConnectionBroken(String),
    #[error("refresh rejected: {0}")]
    Rejected(String),
    #[error("oauth request failed: {0}")]
    Request(String),
    #[error("credential store failed: {0}")]
    Store(String),
}

/// Result of a `grant_type=refresh_token` exchange.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "TokenGrant::default_expires_in")]
    pub expires_in: i64,
}

impl TokenGrant {
    fn default_expires_in() -> i64 {
        3600
    }
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;
}

pub struct OAuthTokenEndpoint {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthTokenEndpoint {
    pub fn new(config: &MarketplaceConfig) -> Self {
        Self {
            http: build_client(),
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[async_trait]
impl TokenEndpoint for OAuthTokenEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        if refresh_token.is_empty() {
            return Err(AuthError::Rejected("empty refresh token".into()));
        }
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];
        let response = self
            .http
            .post(self.token_url.as_str())
            .form(&params)
            .send()
            .await
            .map_err(|err| AuthError::Request(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let grant: TokenGrant = response
                .json()
                .await
                .map_err(|err| AuthError::Request(err.to_string()))?;
            if grant.access_token.trim().is_empty() {
                return Err(AuthError::Request("token response without access_token".into()));
            }
            return Ok(grant);
        }

        let body = response.text().await.unwrap_or_default();
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) {
            let reason = serde_json::from_str::<OAuthErrorBody>(&body)
                .ok()
                .and_then(|b| b.error_description.or(b.error))
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(AuthError::Rejected(reason));
        }
        Err(AuthError::Request(format!("HTTP {status}")))
    }
}
