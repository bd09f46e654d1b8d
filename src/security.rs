use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{debug, info, warn};

/// Shared secrets accepted on the trigger surface (schedulers, cron, operators).
#[derive(Clone)]
pub struct TriggerAuth {
    callers: Arc<HashMap<String, TriggerCaller>>,
}

/// Identity of the caller that presented a known secret.
#[derive(Clone, Debug, PartialEq)]
pub struct TriggerCaller {
    pub name: String,
    pub key_id: String,
}

impl TriggerAuth {
    pub fn from_env() -> Self {
        let raw = env::var("SYNC_TRIGGER_KEYS").unwrap_or_default();
        Self {
            callers: Arc::new(parse_trigger_keys(&raw)),
        }
    }

    #[cfg(test)]
    pub fn from_keys(raw: &str) -> Self {
        Self {
            callers: Arc::new(parse_trigger_keys(raw)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<TriggerCaller> {
        self.callers.get(presented).cloned()
    }
}

pub async fn require_trigger_key(
    State(auth): State<TriggerAuth>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_trigger_key(request.headers()) else {
        return Ok(unauthorized("missing_trigger_key", "Provide X-Sync-Key or Bearer token"));
    };
    let Some(caller) = auth.authenticate(&presented) else {
        return Ok(unauthorized("invalid_trigger_key", "Key not recognized"));
    };
    debug!(
        target = "resale.request",
        caller = %caller.name,
        key_id = %caller.key_id,
        path = %request.uri().path(),
        "trigger authenticated"
    );
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

fn extract_trigger_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Sync-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

/// Parses `name:secret,name:secret`. Without any usable entry a single local
/// development key is accepted so mock mode stays usable.
fn parse_trigger_keys(raw: &str) -> HashMap<String, TriggerCaller> {
    let mut callers = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (name, secret) = match trimmed.split_once(':') {
            Some((name, secret)) => (name.trim(), secret.trim()),
            None => ("", ""),
        };
        if name.is_empty() || secret.is_empty() {
            warn!(target = "resale.request", "ignored malformed SYNC_TRIGGER_KEYS entry #{}", idx + 1);
            continue;
        }
        callers.insert(
            secret.to_string(),
            TriggerCaller {
                name: name.to_string(),
                key_id: format!("key-{:02}", idx + 1),
            },
        );
    }

    if callers.is_empty() {
        warn!(
            target = "resale.request",
            "SYNC_TRIGGER_KEYS produced no keys; accepting the local development key"
        );
        callers.insert(
            "dev-trigger-key".to_string(),
            TriggerCaller {
                name: "local".to_string(),
                key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(target = "resale.request", key_count = callers.len(), "loaded trigger keys");
    }
    callers
}
