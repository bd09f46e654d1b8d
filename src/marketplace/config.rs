use once_cell::sync::Lazy;
use std::env;

pub static MARKETPLACE_ENV: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_ENV").unwrap_or_else(|_| "SANDBOX".to_string()));

pub static CLIENT_ID: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_CLIENT_ID").unwrap_or_default());

pub static CLIENT_SECRET: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_CLIENT_SECRET").unwrap_or_default());

pub static API_KEY: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_API_KEY").unwrap_or_default());

/// Static refresh token behind the application-wide credential.
pub static APP_REFRESH_TOKEN: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_APP_REFRESH_TOKEN").unwrap_or_default());

pub static ROOT: Lazy<String> = Lazy::new(|| {
    env::var("MARKETPLACE_API_ROOT").unwrap_or_else(|_| {
        if MARKETPLACE_ENV.as_str().eq_ignore_ascii_case("PROD") {
            "https://api.stockx.com".to_string()
        } else {
            "https://sandbox.api.stockx.com".to_string()
        }
    })
});

pub static OAUTH_TOKEN_URL: Lazy<String> = Lazy::new(|| {
    env::var("MARKETPLACE_OAUTH_TOKEN_URL")
        .unwrap_or_else(|_| "https://accounts.stockx.com/oauth/token".to_string())
});

/// Connection details for one marketplace deployment.
#[derive(Debug, Clone)]
pub struct MarketplaceConfig {
    pub api_root: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub api_key: String,
    pub app_refresh_token: String,
}

impl MarketplaceConfig {
    pub fn from_env() -> Self {
        Self {
            api_root: ROOT.trim_end_matches('/').to_string(),
            token_url: OAUTH_TOKEN_URL.clone(),
            client_id: CLIENT_ID.clone(),
            client_secret: CLIENT_SECRET.clone(),
            api_key: API_KEY.clone(),
            app_refresh_token: APP_REFRESH_TOKEN.clone(),
        }
    }

    pub fn has_client_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path)
    }
}

/// Which `MarketplaceClient` implementation the process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    Mock,
    Live,
}

impl ProviderMode {
    pub fn from_env() -> Self {
        match env::var("MARKETPLACE_MODE") {
            Ok(value) if value.trim().eq_ignore_ascii_case("live") => ProviderMode::Live,
            _ => ProviderMode::Mock,
        }
    }
}
