use crate::config::SyncConfig;
use crate::http::build_client_with_timeout;
use crate::marketplace::config::MarketplaceConfig;
use crate::marketplace::error::RequestError;
use crate::marketplace::tokens::TokenManager;
use crate::models::CredentialScope;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed for 5xx and network failures.
    pub max_attempts: u32,
    /// Extra attempts allowed for 429s; tracked apart from `max_attempts`.
    pub max_rate_limit_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_after_cap: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            max_rate_limit_retries: config.max_rate_limit_retries,
            base_delay: config.backoff_base,
            max_delay: config.backoff_cap,
            retry_after_cap: config.retry_after_cap,
            attempt_timeout: config.request_timeout,
        }
    }

    /// Surfaces the first 429 to the caller instead of waiting it out.
    pub fn no_rate_limit_retry(mut self) -> Self {
        self.max_rate_limit_retries = 0;
        self
    }

    /// `base * 2^(attempt-1)`, capped. Non-decreasing in `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn rate_limit_delay(&self, hint: Option<Duration>, retry: u32) -> Duration {
        hint.unwrap_or_else(|| self.backoff_delay(retry))
            .min(self.retry_after_cap)
    }
}

/// How a response status is handled. The single source of retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    RateLimited,
    Retryable,
    Unauthorized,
    NotFound,
    Permanent,
}

pub fn classify_status(status: StatusCode) -> Disposition {
    if status.is_success() {
        Disposition::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Disposition::RateLimited
    } else if status.is_server_error() {
        Disposition::Retryable
    } else if status == StatusCode::UNAUTHORIZED {
        Disposition::Unauthorized
    } else if status == StatusCode::NOT_FOUND {
        Disposition::NotFound
    } else {
        Disposition::Permanent
    }
}

struct RawResponse {
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
}

/// Every call to the marketplace goes through here: bounded concurrency, a per-attempt
/// deadline, a fresh token on each attempt, and centrally classified retries.
pub struct RequestClient {
    http: Client,
    api_root: String,
    api_key: String,
    tokens: Arc<TokenManager>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl RequestClient {
    pub fn new(
        config: &MarketplaceConfig,
        tokens: Arc<TokenManager>,
        policy: RetryPolicy,
        max_concurrency: usize,
    ) -> Self {
        Self {
            http: build_client_with_timeout(policy.attempt_timeout + Duration::from_secs(5)),
            api_root: config.api_root.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            tokens,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn request(
        &self,
        scope: CredentialScope,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        policy: Option<&RetryPolicy>,
    ) -> Result<Value, RequestError> {
        let policy = policy.unwrap_or(&self.policy);
        let mut failures: u32 = 0;
        let mut rate_limited: u32 = 0;
        let mut last_error = String::new();

        loop {
            let token = self.tokens.get_valid_token(scope).await?;
            let outcome = {
                let _permit = self.permits.acquire().await.map_err(|_| {
                    RequestError::TransientServer {
                        attempts: failures,
                        detail: "request pool closed".into(),
                    }
                })?;
                tokio::time::timeout(
                    policy.attempt_timeout,
                    self.send_once(&method, endpoint, &token, body),
                )
                .await
            };

            let raw = match outcome {
                Err(_) => {
                    warn!(target = "resale.request", %method, endpoint, "attempt_timed_out");
                    return Err(RequestError::Timeout(policy.attempt_timeout));
                }
                Ok(Err(err)) if err.is_timeout() => {
                    return Err(RequestError::Timeout(policy.attempt_timeout));
                }
                Ok(Err(err)) => {
                    failures += 1;
                    last_error = err.to_string();
                    if failures >= policy.max_attempts {
                        break;
                    }
                    let delay = policy.backoff_delay(failures);
                    warn!(target = "resale.request", %method, endpoint, attempt = failures, ?delay, error = %err, "network error, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Ok(Ok(raw)) => raw,
            };

            crate::metrics::remote_attempt(method.as_str(), raw.status.as_u16());
            match classify_status(raw.status) {
                Disposition::Success => return parse_body(&raw.body),
                Disposition::RateLimited => {
                    if rate_limited >= policy.max_rate_limit_retries {
                        return Err(RequestError::RateLimited {
                            retry_after: raw.retry_after,
                        });
                    }
                    rate_limited += 1;
                    let delay = policy.rate_limit_delay(raw.retry_after, rate_limited);
                    warn!(target = "resale.request", %method, endpoint, retry = rate_limited, ?delay, "rate limited, waiting");
                    tokio::time::sleep(delay).await;
                }
                Disposition::Retryable => {
                    failures += 1;
                    last_error = format!("HTTP {}: {}", raw.status, truncate(&raw.body));
                    if failures >= policy.max_attempts {
                        break;
                    }
                    let delay = policy.backoff_delay(failures);
                    warn!(target = "resale.request", %method, endpoint, attempt = failures, ?delay, status = raw.status.as_u16(), "server error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Disposition::Unauthorized => {
                    return Err(RequestError::Unauthorized(truncate(&raw.body)));
                }
                Disposition::NotFound => {
                    return Err(RequestError::NotFound(endpoint.to_string()));
                }
                Disposition::Permanent => {
                    return Err(RequestError::PermanentClient {
                        status: raw.status,
                        body: truncate(&raw.body),
                    });
                }
            }
        }

        Err(RequestError::TransientServer {
            attempts: failures,
            detail: last_error,
        })
    }

    async fn send_once(
        &self,
        method: &Method,
        endpoint: &str,
        token: &str,
        body: Option<&Value>,
    ) -> Result<RawResponse, reqwest::Error> {
        let url = format!("{}{}", self.api_root, endpoint);
        debug!(target = "resale.request", %method, %url, "sending");
        let mut builder = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token)
            .header("x-api-key", &self.api_key);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await?;
        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn parse_body(body: &str) -> Result<Value, RequestError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|err| RequestError::Decode(err.to_string()))
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::marketplace::tokens::TokenCache;
    use crate::marketplace::tokens::tests::{CountingEndpoint, fresh};
    use crate::store::{CredentialStore, MemoryStore};
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            max_rate_limit_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            retry_after_cap: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(2),
        }
    }

    pub(crate) fn test_config(server: &MockServer) -> MarketplaceConfig {
        MarketplaceConfig {
            api_root: server.uri(),
            token_url: format!("{}/oauth/token", server.uri()),
            client_id: "client".into(),
            client_secret: "secret".into(),
            api_key: "test-api-key".into(),
            app_refresh_token: "app-refresh".into(),
        }
    }

    /// Request client backed by a seller credential that is already fresh.
    pub(crate) async fn seeded_client(
        server: &MockServer,
        policy: RetryPolicy,
    ) -> (RequestClient, CredentialScope) {
        let store = Arc::new(MemoryStore::new());
        let scope = CredentialScope::Seller(Uuid::new_v4());
        store.save_credential(&fresh(scope)).await.unwrap();
        let tokens = Arc::new(TokenManager::new(
            store,
            Arc::new(CountingEndpoint::new()),
            Arc::new(TokenCache::new()),
            "app-refresh",
            chrono::Duration::seconds(60),
        ));
        (
            RequestClient::new(&test_config(server), tokens, policy, 2),
            scope,
        )
    }

    #[test]
    fn classification_is_centralized() {
        assert_eq!(classify_status(StatusCode::OK), Disposition::Success);
        assert_eq!(classify_status(StatusCode::ACCEPTED), Disposition::Success);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Disposition::RateLimited
        );
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), Disposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), Disposition::Unauthorized);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), Disposition::NotFound);
        assert_eq!(classify_status(StatusCode::CONFLICT), Disposition::Permanent);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), Disposition::Permanent);
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(2));
        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let delay = policy.backoff_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(10));
            previous = delay;
        }
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.rate_limit_delay(Some(Duration::from_secs(120)), 1),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.rate_limit_delay(Some(Duration::from_secs(3)), 1),
            Duration::from_secs(3)
        );
    }

    #[tokio::test]
    async fn attaches_bearer_token_and_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/ping"))
            .and(header("authorization", "Bearer fresh-token"))
            .and(header("x-api-key", "test-api-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let (client, scope) = seeded_client(&server, fast_policy()).await;
        let value = client
            .request(scope, Method::GET, "/v2/ping", None, None)
            .await
            .unwrap();
        assert_eq!(value["ok"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/selling/listings"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad amount"))
            .expect(1)
            .mount(&server)
            .await;

        let (client, scope) = seeded_client(&server, fast_policy()).await;
        let err = client
            .request(
                scope,
                Method::POST,
                "/v2/selling/listings",
                Some(&serde_json::json!({"amount": "-1"})),
                None,
            )
            .await
            .unwrap_err();
        match err {
            RequestError::PermanentClient { status, body } => {
                assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(body, "bad amount");
            }
            other => panic!("expected PermanentClient, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_errors_retry_up_to_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let (client, scope) = seeded_client(&server, fast_policy()).await;
        let err = client
            .request(scope, Method::GET, "/v2/flaky", None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RequestError::TransientServer { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/recover"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/recover"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([1, 2])))
            .mount(&server)
            .await;

        let (client, scope) = seeded_client(&server, fast_policy()).await;
        let value = client
            .request(scope, Method::GET, "/v2/recover", None, None)
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn rate_limits_use_their_own_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .expect(3)
            .mount(&server)
            .await;

        let (client, scope) = seeded_client(&server, fast_policy()).await;
        let err = client
            .request(scope, Method::GET, "/v2/busy", None, None)
            .await
            .unwrap_err();
        match err {
            RequestError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::ZERO))
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_after_is_waited_before_the_next_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/throttled"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/throttled"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let policy = RetryPolicy {
            retry_after_cap: Duration::from_secs(5),
            ..fast_policy()
        };
        let (client, scope) = seeded_client(&server, policy).await;
        let started = std::time::Instant::now();
        let value = client
            .request(scope, Method::GET, "/v2/throttled", None, None)
            .await
            .unwrap();

        assert_eq!(value["ok"], true);
        assert!(
            started.elapsed() >= Duration::from_secs(1),
            "retried after {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn rate_limit_then_server_errors_still_get_full_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/mixed"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/mixed"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let (client, scope) = seeded_client(&server, fast_policy()).await;
        let err = client
            .request(scope, Method::GET, "/v2/mixed", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::TransientServer { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn no_rate_limit_retry_surfaces_first_429() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/busy"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let (client, scope) = seeded_client(&server, fast_policy()).await;
        let policy = fast_policy().no_rate_limit_retry();
        let err = client
            .request(scope, Method::GET, "/v2/busy", None, Some(&policy))
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn not_found_and_unauthorized_are_distinguished() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/denied"))
            .respond_with(ResponseTemplate::new(401).set_body_string("token revoked"))
            .expect(1)
            .mount(&server)
            .await;

        let (client, scope) = seeded_client(&server, fast_policy()).await;
        let err = client
            .request(scope, Method::GET, "/v2/gone", None, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = client
            .request(scope, Method::GET, "/v2/denied", None, None)
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn slow_attempt_times_out_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/slow"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_millis(500)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(100),
            ..fast_policy()
        };
        let (client, scope) = seeded_client(&server, policy).await;
        let err = client
            .request(scope, Method::GET, "/v2/slow", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Timeout(_)));
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/garbled"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let (client, scope) = seeded_client(&server, fast_policy()).await;
        let err = client
            .request(scope, Method::GET, "/v2/garbled", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Decode(_)));
    }
}
