use chrono::Duration as ChronoDuration;
use std::time::Duration;

/// Engine tunables. Every field has a default matching the marketplace's published limits.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub token_skew: ChronoDuration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub max_rate_limit_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub retry_after_cap: Duration,
    pub max_concurrent_requests: usize,
    pub poll_min_interval: ChronoDuration,
    pub poll_batch_limit: usize,
    pub operation_timeout: ChronoDuration,
    pub poll_loop_interval: Duration,
    pub reconcile_page_size: u32,
    pub reconcile_max_pages: u32,
    pub reconcile_upsert_chunk: usize,
    pub market_ttl: ChronoDuration,
    pub region_delay: Duration,
    pub batch_call_spacing: Duration,
    pub batch_limit: usize,
    /// How long a claimed job stays reserved before another run may take it over.
    pub job_lease: ChronoDuration,
    pub primary_currency: String,
    pub secondary_currencies: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            token_skew: ChronoDuration::seconds(60),
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            max_rate_limit_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(10),
            retry_after_cap: Duration::from_secs(30),
            max_concurrent_requests: 4,
            poll_min_interval: ChronoDuration::seconds(20),
            poll_batch_limit: 50,
            operation_timeout: ChronoDuration::minutes(15),
            poll_loop_interval: Duration::from_secs(30),
            reconcile_page_size: 100,
            reconcile_max_pages: 50,
            reconcile_upsert_chunk: 100,
            market_ttl: ChronoDuration::minutes(30),
            region_delay: Duration::from_secs(2),
            batch_call_spacing: Duration::from_millis(600),
            batch_limit: 25,
            job_lease: ChronoDuration::minutes(15),
            primary_currency: "USD".to_string(),
            secondary_currencies: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            token_skew: ChronoDuration::seconds(
                env_parse("TOKEN_REFRESH_SKEW_SECS").unwrap_or(60),
            ),
            request_timeout: Duration::from_secs(
                env_parse("MARKETPLACE_TIMEOUT_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(30),
            ),
            max_attempts: env_parse("MARKETPLACE_MAX_ATTEMPTS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_attempts),
            max_rate_limit_retries: env_parse("MARKETPLACE_MAX_RATE_LIMIT_RETRIES")
                .unwrap_or(defaults.max_rate_limit_retries),
            backoff_base: Duration::from_millis(
                env_parse("MARKETPLACE_BACKOFF_BASE_MS").unwrap_or(500),
            ),
            max_concurrent_requests: env_parse("MARKETPLACE_MAX_CONCURRENCY")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_concurrent_requests),
            poll_batch_limit: env_parse("OPERATION_POLL_BATCH")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.poll_batch_limit),
            poll_loop_interval: Duration::from_secs(
                env_parse("OPERATION_POLL_INTERVAL_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(30),
            ),
            market_ttl: ChronoDuration::minutes(
                env_parse("MARKET_DATA_TTL_MINUTES")
                    .filter(|v| *v > 0)
                    .unwrap_or(30),
            ),
            region_delay: Duration::from_millis(env_parse("REGION_DELAY_MS").unwrap_or(2000)),
            batch_call_spacing: Duration::from_millis(
                env_parse("BATCH_CALL_SPACING_MS").unwrap_or(600),
            ),
            batch_limit: env_parse("BATCH_LIMIT")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.batch_limit),
            job_lease: ChronoDuration::seconds(
                env_parse("SYNC_JOB_LEASE_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(900),
            ),
            primary_currency: std::env::var("MARKET_PRIMARY_CURRENCY")
                .ok()
                .map(|v| v.trim().to_uppercase())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.primary_currency),
            secondary_currencies: std::env::var("MARKET_SECONDARY_CURRENCIES")
                .map(|raw| parse_currency_list(&raw))
                .unwrap_or_default(),
            ..defaults
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

pub fn parse_currency_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for code in raw.split(',').map(|s| s.trim().to_uppercase()) {
        if !code.is_empty() && !out.contains(&code) {
            out.push(code);
        }
    }
    out
}
