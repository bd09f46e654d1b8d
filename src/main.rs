mod config;
mod http;
mod idempotency;
mod jobs;
mod marketplace;
mod metrics;
mod models;
mod security;
mod store;
mod sync;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use config::SyncConfig;
use idempotency::{ReceiptCache, Reservation};
use marketplace::auth::{AuthError, OAuthTokenEndpoint, TokenGrant};
use marketplace::config::{MarketplaceConfig, ProviderMode};
use marketplace::wire::OrderPage;
use marketplace::{
    LiveMarketplaceClient, MarketplaceClient, MockMarketplaceClient, RequestClient, RequestError,
    RetryPolicy, TokenCache, TokenManager,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, CredentialScope, SyncJob};
use security::{TriggerAuth, TriggerCaller, require_trigger_key};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{JobStore, MemoryStore, PostgrestStore, SyncStore};
use sync::market::RegionRefresh;
use sync::scheduler::spawn_poll_loop;
use sync::{
    BatchSummary, Mutation, PollSummary, ReconcileMode, ReconcileSummary, SubmitReceipt,
    SyncEngine, SyncError,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "resale.request", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = SyncConfig::from_env();
    let mode = ProviderMode::from_env();
    let (engine, tokens) = match PostgrestStore::from_env() {
        Some(store) => assemble(Arc::new(store), mode, &config).await,
        None => {
            if mode == ProviderMode::Live {
                warn!(
                    target = "resale.request",
                    "live marketplace without SUPABASE_URL; state will not survive a restart"
                );
            }
            assemble(Arc::new(MemoryStore::new()), mode, &config).await
        }
    };
    let _poller = spawn_poll_loop(engine.tracker.clone(), config.poll_loop_interval);

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let state = AppState {
        engine,
        tokens,
        receipts: ReceiptCache::from_env(),
        prometheus_handle,
        mode,
    };
    let app = router(state, TriggerAuth::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "resale.request", ?mode, "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Wires the token manager, the selected marketplace provider and the engine against one store.
async fn assemble<S: SyncStore + 'static>(
    store: Arc<S>,
    mode: ProviderMode,
    config: &SyncConfig,
) -> (SyncEngine, Arc<TokenManager>) {
    let marketplace = MarketplaceConfig::from_env();
    let tokens = Arc::new(TokenManager::new(
        store.clone(),
        Arc::new(OAuthTokenEndpoint::new(&marketplace)),
        Arc::new(TokenCache::new()),
        marketplace.app_refresh_token.clone(),
        config.token_skew,
    ));
    let client: Arc<dyn MarketplaceClient> = match mode {
        ProviderMode::Mock => Arc::new(
            MockMarketplaceClient::auto_completing()
                .with_demo_catalog()
                .await,
        ),
        ProviderMode::Live => {
            if !marketplace.has_client_credentials() {
                warn!(
                    target = "resale.request",
                    "MARKETPLACE_CLIENT_ID/SECRET missing; token refreshes will fail"
                );
            }
            let requests = RequestClient::new(
                &marketplace,
                tokens.clone(),
                RetryPolicy::from_config(config),
                config.max_concurrent_requests,
            );
            Arc::new(LiveMarketplaceClient::new(Arc::new(requests)))
        }
    };
    let engine = SyncEngine::new(store, client, tokens.clone(), config);
    (engine, tokens)
}

#[derive(Clone)]
struct AppState {
    engine: SyncEngine,
    tokens: Arc<TokenManager>,
    receipts: ReceiptCache,
    prometheus_handle: PrometheusHandle,
    mode: ProviderMode,
}

fn router(state: AppState, auth: TriggerAuth) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .nest(
            "/cron",
            Router::new()
                .route("/batch", post(cron_batch))
                .route("/operations/poll", post(cron_poll)),
        )
        .nest(
            "/sellers/{id}",
            Router::new()
                .route("/reconcile", post(reconcile_seller))
                .route("/operations", post(submit_operation))
                .route("/jobs", post(enqueue_jobs))
                .route("/orders", get(list_orders))
                .route(
                    "/credentials",
                    post(connect_seller).delete(disconnect_seller),
                ),
        )
        .route("/products/{id}/refresh", post(refresh_product))
        .route("/jobs/{id}", get(get_job_status))
        .route("/operations/{id}", get(get_operation))
        .route_layer(middleware::from_fn_with_state(auth, require_trigger_key));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mode = match state.mode {
        ProviderMode::Mock => "mock",
        ProviderMode::Live => "live",
    };
    Json(json!({
        "status": "ok",
        "service": "resale-sync-rs",
        "mode": mode,
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct BatchParams {
    #[serde(default)]
    limit: Option<usize>,
}

/// Drain pending sync jobs for every seller that has some.
///
/// - Method: `POST`
/// - Path: `/cron/batch?limit=N`
/// - Response: `BatchSummary` summed over sellers
async fn cron_batch(
    State(state): State<AppState>,
    Extension(caller): Extension<TriggerCaller>,
    Query(params): Query<BatchParams>,
) -> Result<Json<BatchSummary>, AppError> {
    crate::metrics::inc_requests("/cron/batch");
    let started = std::time::Instant::now();
    let limit = params
        .limit
        .filter(|l| *l > 0)
        .unwrap_or_else(|| state.engine.batch.default_limit());
    let summary = state.engine.batch.run_all(limit).await?;
    info!(
        target = "resale.request",
        caller = %caller.name,
        processed = summary.processed,
        deferred = summary.deferred,
        "batch trigger finished"
    );
    crate::metrics::stage_elapsed("cron_batch", started.elapsed().as_millis());
    Ok(Json(summary))
}

/// One operation poll cycle: time out stale operations, then poll the due ones.
async fn cron_poll(State(state): State<AppState>) -> Result<Json<PollSummary>, AppError> {
    crate::metrics::inc_requests("/cron/operations/poll");
    let summary = state.engine.tracker.poll_cycle(Utc::now()).await?;
    Ok(Json(summary))
}

#[derive(Debug, Default, Deserialize)]
struct ReconcileParams {
    #[serde(default)]
    mode: ReconcileMode,
}

async fn reconcile_seller(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
    Query(params): Query<ReconcileParams>,
) -> Result<Json<ReconcileSummary>, AppError> {
    crate::metrics::inc_requests("/sellers/reconcile");
    let summary = state
        .engine
        .reconciler
        .reconcile(seller_id, params.mode)
        .await?;
    Ok(Json(summary))
}

#[derive(Debug, Default, Deserialize)]
struct RefreshParams {
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    ttl_secs: Option<i64>,
}

/// Refresh market data for one product.
///
/// The primary currency is refreshed inline and reported in the response; secondary
/// currencies are queued and can be followed through `GET /jobs/{job_id}`.
async fn refresh_product(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
    Query(params): Query<RefreshParams>,
) -> Result<Json<RegionRefresh>, AppError> {
    crate::metrics::inc_requests("/products/refresh");
    let market = &state.engine.market;
    let ttl = params
        .ttl_secs
        .filter(|s| *s >= 0)
        .map(chrono::Duration::seconds)
        .unwrap_or_else(|| market.default_ttl());
    let primary = params
        .currency
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| market.primary_currency().to_string());
    let outcome = market
        .ensure_fresh_regions(&product_id, &primary, market.secondary_currencies(), ttl)
        .await;
    Ok(Json(outcome))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    state
        .engine
        .regions
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::from(SyncError::NotFound(format!("job {id}"))))
}

/// Submit a listing mutation. Returns as soon as the marketplace accepted it; the
/// outcome arrives through the poll cycle.
///
/// - Method: `POST`
/// - Path: `/sellers/{id}/operations`
/// - Body: `Mutation` (`{"kind": "create", "local_item_id": ..., "amount": 150}`)
/// - Headers: optional `Idempotency-Key`; a replay returns the first receipt
async fn submit_operation(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
    headers: HeaderMap,
    Json(mutation): Json<Mutation>,
) -> Result<(StatusCode, Json<SubmitReceipt>), AppError> {
    crate::metrics::inc_requests("/sellers/operations");
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let Some(key) = key else {
        let receipt = state.engine.tracker.submit(seller_id, mutation).await?;
        return Ok((StatusCode::ACCEPTED, Json(receipt)));
    };
    match state.receipts.reserve(seller_id, &key).await {
        Reservation::Replay(existing) => {
            info!(target = "resale.request", %seller_id, operation_id = %existing.operation_id, "idempotent replay");
            Ok((StatusCode::ACCEPTED, Json(existing)))
        }
        Reservation::InFlight => Err(SyncError::Conflict(
            "a request with this Idempotency-Key is still in flight".into(),
        )
        .into()),
        Reservation::Acquired => match state.engine.tracker.submit(seller_id, mutation).await {
            Ok(receipt) => {
                state.receipts.complete(seller_id, &key, &receipt).await;
                Ok((StatusCode::ACCEPTED, Json(receipt)))
            }
            Err(err) => {
                state.receipts.release(seller_id, &key).await;
                Err(err.into())
            }
        },
    }
}

async fn get_operation(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<Json<models::Operation>, AppError> {
    state
        .engine
        .tracker
        .get(&operation_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::from(SyncError::NotFound(format!("operation {operation_id}"))))
}

#[derive(Debug, Deserialize)]
struct JobRequest {
    sku: String,
    #[serde(default)]
    size: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_ids: Vec<Uuid>,
}

/// Queue catalog sync jobs for a seller; `/cron/batch` picks them up.
async fn enqueue_jobs(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
    Json(requests): Json<Vec<JobRequest>>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/sellers/jobs");
    if requests.iter().any(|r| r.sku.trim().is_empty()) {
        return Err(SyncError::InvalidInput("sku must not be empty".into()).into());
    }
    let jobs: Vec<SyncJob> = requests
        .into_iter()
        .map(|r| SyncJob::new(seller_id, r.sku.trim(), r.size))
        .collect();
    state
        .engine
        .store()
        .enqueue_jobs(&jobs)
        .await
        .map_err(SyncError::from)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_ids: jobs.iter().map(|j| j.job_id).collect(),
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct OrderParams {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    page_size: Option<u32>,
}

/// Page through the seller's marketplace orders.
///
/// - Method: `GET`
/// - Path: `/sellers/{id}/orders?page=1&page_size=50`
async fn list_orders(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
    Query(params): Query<OrderParams>,
) -> Result<Json<OrderPage>, AppError> {
    crate::metrics::inc_requests("/sellers/orders");
    let page = state
        .engine
        .recent_orders(
            seller_id,
            params.page.unwrap_or(1),
            params.page_size.unwrap_or(50),
        )
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
struct ConnectionResponse {
    seller_id: Uuid,
    expires_at: chrono::DateTime<Utc>,
}

/// Store tokens from an authorization flow completed elsewhere. Clears a broken connection.
async fn connect_seller(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
    Json(grant): Json<TokenGrant>,
) -> Result<Json<ConnectionResponse>, AppError> {
    let credential = state
        .tokens
        .store_grant(CredentialScope::Seller(seller_id), grant)
        .await
        .map_err(SyncError::from)?;
    Ok(Json(ConnectionResponse {
        seller_id,
        expires_at: credential.expires_at,
    }))
}

async fn disconnect_seller(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state
        .tokens
        .disconnect(seller_id)
        .await
        .map_err(SyncError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug)]
struct AppError(SyncError);

impl From<SyncError> for AppError {
    fn from(value: SyncError) -> Self {
        Self(value)
    }
}

fn auth_status(err: &AuthError) -> (StatusCode, &'static str) {
    match err {
        AuthError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
        AuthError::MissingCredentials => (StatusCode::INTERNAL_SERVER_ERROR, "misconfigured"),
        _ => (StatusCode::UNAUTHORIZED, "unauthorized"),
    }
}

fn status_for(err: &SyncError) -> (StatusCode, &'static str) {
    match err {
        SyncError::Auth(auth) => auth_status(auth),
        SyncError::Request(request) => match request {
            RequestError::Auth(auth) => auth_status(auth),
            RequestError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            RequestError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            RequestError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            RequestError::PermanentClient { .. } => (StatusCode::BAD_REQUEST, "rejected"),
            RequestError::Decode(_) => (StatusCode::BAD_GATEWAY, "malformed_upstream_payload"),
            RequestError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            RequestError::TransientServer { .. } => (StatusCode::BAD_GATEWAY, "upstream_unavailable"),
        },
        SyncError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
        SyncError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        SyncError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        SyncError::Conflict(_) => (StatusCode::CONFLICT, "in_flight"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = status_for(&self.0);
        if status.is_server_error() {
            error!(target = "resale.request", error = %self.0, "request failed");
        }
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(self.0.to_string()),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ListingStatus;
    use crate::store::StoreError;
    use crate::sync::testkit::Harness;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use marketplace::mock::{MockCall, MockFailure};
    use marketplace::wire::RemoteOrder;
    use tower::ServiceExt;

    const KEY: &str = "test-secret";

    fn app(h: &Harness) -> Router {
        let engine = SyncEngine::new(h.store.clone(), h.mock.clone(), h.tokens.clone(), &h.config);
        let state = AppState {
            engine,
            tokens: h.tokens.clone(),
            receipts: ReceiptCache::new(None, 60),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
            mode: ProviderMode::Mock,
        };
        router(state, TriggerAuth::from_keys(&format!("cron:{KEY}")))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("X-Sync-Key", KEY)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_key() {
        let h = Harness::new().await;
        let response = app(&h)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["mode"], "mock");
    }

    #[tokio::test]
    async fn triggers_reject_missing_and_unknown_keys() {
        let h = Harness::new().await;
        let missing = app(&h)
            .oneshot(
                Request::post("/cron/operations/poll")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(missing).await["error"], "missing_trigger_key");

        let wrong = app(&h)
            .oneshot(
                Request::post("/cron/operations/poll")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn idempotent_submission_replays_receipt() {
        let h = Harness::new().await;
        let mapping = h.mapping(None, ListingStatus::Unlisted).await;
        let app = app(&h);
        let body = json!({"kind": "create", "local_item_id": mapping.local_item_id, "amount": 150});
        let request = || {
            let mut req = post_json(&format!("/sellers/{}/operations", h.seller), body.clone());
            req.headers_mut()
                .insert("Idempotency-Key", "abc".parse().unwrap());
            req
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let first = json_body(first).await;
        let second = json_body(app.clone().oneshot(request()).await.unwrap()).await;

        assert_eq!(first["operation_id"], second["operation_id"]);
        assert_eq!(first["status"], "pending");
        assert_eq!(h.mock.calls(MockCall::Create).await, 1);

        let op = first["operation_id"].as_str().unwrap();
        let fetched = app
            .oneshot(
                Request::get(format!("/operations/{op}"))
                    .header("X-Sync-Key", KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn key_still_submitting_is_a_conflict() {
        let h = Harness::new().await;
        let mapping = h.mapping(None, ListingStatus::Unlisted).await;
        let receipts = ReceiptCache::new(None, 60);
        let engine = SyncEngine::new(h.store.clone(), h.mock.clone(), h.tokens.clone(), &h.config);
        let app = router(
            AppState {
                engine,
                tokens: h.tokens.clone(),
                receipts: receipts.clone(),
                prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
                mode: ProviderMode::Mock,
            },
            TriggerAuth::from_keys(&format!("cron:{KEY}")),
        );
        assert_eq!(receipts.reserve(h.seller, "busy").await, Reservation::Acquired);

        let mut request = post_json(
            &format!("/sellers/{}/operations", h.seller),
            json!({"kind": "create", "local_item_id": mapping.local_item_id, "amount": 150}),
        );
        request
            .headers_mut()
            .insert("Idempotency-Key", "busy".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["error"], "in_flight");
        assert_eq!(h.mock.calls(MockCall::Create).await, 0);
    }

    #[tokio::test]
    async fn failed_submission_frees_its_key() {
        let h = Harness::new().await;
        let mapping = h.mapping(None, ListingStatus::Unlisted).await;
        h.mock.inject(MockCall::Create, MockFailure::Transient).await;
        let app = app(&h);
        let request = || {
            let mut req = post_json(
                &format!("/sellers/{}/operations", h.seller),
                json!({"kind": "create", "local_item_id": mapping.local_item_id, "amount": 150}),
            );
            req.headers_mut()
                .insert("Idempotency-Key", "retry-me".parse().unwrap());
            req
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::BAD_GATEWAY);
        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn orders_are_paged_from_the_marketplace() {
        let h = Harness::new().await;
        for n in 1..=3 {
            h.mock
                .add_order(RemoteOrder {
                    order_number: format!("ORD-{n}"),
                    listing_id: Some(format!("L{n}")),
                    status: "COMPLETED".into(),
                    amount: Some(120.0),
                    currency: Some("USD".into()),
                    created_at: None,
                })
                .await;
        }
        let response = app(&h)
            .oneshot(
                Request::get(format!("/sellers/{}/orders?page=2&page_size=2", h.seller))
                    .header("X-Sync-Key", KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["orders"][0]["order_number"], "ORD-3");
        assert_eq!(body["has_next"], false);
        assert_eq!(h.mock.calls(MockCall::ListOrders).await, 1);
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let h = Harness::new().await;
        let response = app(&h)
            .oneshot(post_json(
                &format!("/sellers/{}/operations", h.seller),
                json!({"kind": "delete", "local_item_id": Uuid::new_v4()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn non_positive_amount_is_bad_request() {
        let h = Harness::new().await;
        let mapping = h.mapping(None, ListingStatus::Unlisted).await;
        let response = app(&h)
            .oneshot(post_json(
                &format!("/sellers/{}/operations", h.seller),
                json!({"kind": "create", "local_item_id": mapping.local_item_id, "amount": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn enqueued_jobs_are_drained_by_batch_trigger() {
        let mut h = Harness::new().await;
        h.config.batch_call_spacing = std::time::Duration::from_millis(1);
        h.mock.add_product("P9", "SKU-9", "Runner", &["10"]).await;
        let app = app(&h);

        let queued = app
            .clone()
            .oneshot(post_json(
                &format!("/sellers/{}/jobs", h.seller),
                json!([{"sku": "SKU-9", "size": "10"}]),
            ))
            .await
            .unwrap();
        assert_eq!(queued.status(), StatusCode::ACCEPTED);

        let summary = json_body(app.oneshot(post_json("/cron/batch", json!({}))).await.unwrap()).await;
        assert_eq!(summary["succeeded"], 1);
        assert_eq!(summary["failed"], 0);
    }

    #[tokio::test]
    async fn reconcile_accepts_mode_query() {
        let h = Harness::new().await;
        let response = app(&h)
            .oneshot(post_json(
                &format!("/sellers/{}/reconcile?mode=full", h.seller),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["total_remote"], 0);
    }

    #[tokio::test]
    async fn unknown_region_job_is_not_found() {
        let h = Harness::new().await;
        let response = app(&h)
            .oneshot(
                Request::get(format!("/jobs/{}", Uuid::new_v4()))
                    .header("X-Sync-Key", KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        let cases = [
            (
                SyncError::Request(RequestError::RateLimited { retry_after: None }),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                SyncError::Request(RequestError::Timeout(std::time::Duration::from_secs(30))),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                SyncError::Request(RequestError::TransientServer {
                    attempts: 3,
                    detail: "HTTP 503".into(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                SyncError::Auth(AuthError::ConnectionBroken("seller".into())),
                StatusCode::UNAUTHORIZED,
            ),
            (
                SyncError::Store(StoreError::Request("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                SyncError::Request(RequestError::Decode("no id".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                SyncError::Conflict("key busy".into()),
                StatusCode::CONFLICT,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err).0, expected, "{err}");
        }
    }
}
