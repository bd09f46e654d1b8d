use crate::config::SyncConfig;
use crate::jobs::{RegionQueue, RegionRefresher};
use crate::marketplace::{MarketplaceClient, RetryPolicy};
use crate::models::{CredentialScope, MarketSnapshot};
use crate::store::SyncStore;
use crate::sync::SyncError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FreshnessReport {
    pub product_id: String,
    pub currency: String,
    pub refreshed: bool,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub snapshots: Vec<MarketSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionRefresh {
    pub primary: FreshnessReport,
    /// Background job for the secondary regions, when one was queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

/// Freshly captured prices for one product and currency.
#[derive(Debug, Clone)]
pub struct Capture {
    pub snapshots: Vec<MarketSnapshot>,
    pub warnings: Vec<String>,
}

type FlightKey = (String, String);

/// Keeps market snapshots younger than a TTL without re-fetching what is already fresh.
pub struct MarketRefresher {
    store: Arc<dyn SyncStore>,
    client: Arc<dyn MarketplaceClient>,
    regions: RegionQueue,
    ttl: Duration,
    primary_currency: String,
    secondary_currencies: Vec<String>,
    flights: Mutex<HashMap<FlightKey, Arc<Mutex<()>>>>,
}

impl MarketRefresher {
    pub fn new(
        store: Arc<dyn SyncStore>,
        client: Arc<dyn MarketplaceClient>,
        regions: RegionQueue,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            client,
            regions,
            ttl: config.market_ttl,
            primary_currency: config.primary_currency.clone(),
            secondary_currencies: config.secondary_currencies.clone(),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.ttl
    }

    pub fn primary_currency(&self) -> &str {
        &self.primary_currency
    }

    pub fn secondary_currencies(&self) -> &[String] {
        &self.secondary_currencies
    }

    /// Refreshes when the last capture of (product, currency) is missing or older than
    /// `ttl`. Remote or store failures fall back to cached snapshots marked stale.
    pub async fn ensure_fresh(&self, product_id: &str, currency: &str, ttl: Duration) -> FreshnessReport {
        let currency = currency.to_uppercase();
        let key = (product_id.to_string(), currency.clone());
        let flight = self.flight(&key).await;
        let report = {
            let _guard = flight.lock().await;
            self.fresh_or_refresh(product_id, &currency, ttl).await
        };
        self.land(&key, flight).await;
        report
    }

    async fn fresh_or_refresh(&self, product_id: &str, currency: &str, ttl: Duration) -> FreshnessReport {
        let currency = currency.to_string();
        let mut report = FreshnessReport {
            product_id: product_id.to_string(),
            currency: currency.clone(),
            refreshed: false,
            stale: false,
            error: None,
            warnings: Vec::new(),
            snapshots: Vec::new(),
        };

        let now = Utc::now();
        let latest = match self.store.latest_capture(product_id, &currency).await {
            Ok(latest) => latest,
            Err(err) => {
                report.warnings.push(format!("reading last capture failed: {err}"));
                None
            }
        };
        if is_fresh(latest, now, ttl) {
            debug!(target = "resale.market", product_id, %currency, "market data fresh");
            report.snapshots = self.cached(product_id, &currency, &mut report.warnings).await;
            return report;
        }

        let started = Instant::now();
        match self.refresh(product_id, &currency, None).await {
            Ok(capture) => {
                report.refreshed = true;
                report.snapshots = capture.snapshots;
                report.warnings.extend(capture.warnings);
                crate::metrics::stage_elapsed("market_refresh", started.elapsed().as_millis());
            }
            Err(err) => {
                warn!(
                    target = "resale.market",
                    product_id,
                    %currency,
                    error = %err,
                    "market refresh failed, serving cached data"
                );
                report.stale = true;
                report.error = Some(err.to_string());
                report.snapshots = self.cached(product_id, &currency, &mut report.warnings).await;
            }
        }
        report
    }

    /// Primary region inline; secondary regions queued only once the primary succeeded.
    pub async fn ensure_fresh_regions(
        self: &Arc<Self>,
        product_id: &str,
        primary: &str,
        secondaries: &[String],
        ttl: Duration,
    ) -> RegionRefresh {
        let report = self.ensure_fresh(product_id, primary, ttl).await;
        let secondaries: Vec<String> = secondaries
            .iter()
            .map(|c| c.to_uppercase())
            .filter(|c| !c.eq_ignore_ascii_case(primary))
            .collect();
        if report.error.is_some() || secondaries.is_empty() {
            return RegionRefresh {
                primary: report,
                job_id: None,
            };
        }

        let refresher: Arc<dyn RegionRefresher> = self.clone();
        let job_id = match self
            .regions
            .enqueue(product_id.to_string(), secondaries, ttl, refresher)
            .await
        {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(target = "resale.market", product_id, error = %err.error, "region queue unavailable");
                None
            }
        };
        RegionRefresh {
            primary: report,
            job_id,
        }
    }

    /// Variants, then one market-data call, then one snapshot per variant.
    pub async fn refresh(
        &self,
        product_id: &str,
        currency: &str,
        policy: Option<&RetryPolicy>,
    ) -> Result<Capture, SyncError> {
        let variants = self
            .client
            .list_variants(CredentialScope::Application, product_id, policy)
            .await?;
        self.store.upsert_variants(&variants).await?;
        self.capture(product_id, currency, policy).await
    }

    /// Fetches prices for every variant of `product_id` and appends them as snapshots.
    pub async fn capture(
        &self,
        product_id: &str,
        currency: &str,
        policy: Option<&RetryPolicy>,
    ) -> Result<Capture, SyncError> {
        let rows = self
            .client
            .market_data(CredentialScope::Application, product_id, currency, policy)
            .await?;
        let captured_at = Utc::now();
        let snapshots: Vec<MarketSnapshot> = rows
            .into_iter()
            .map(|row| MarketSnapshot {
                product_id: product_id.to_string(),
                variant_id: row.variant_id,
                currency: currency.to_uppercase(),
                lowest_ask: row.lowest_ask,
                highest_bid: row.highest_bid,
                captured_at,
            })
            .collect();
        self.store.insert_snapshots(&snapshots).await?;

        let mut warnings = Vec::new();
        // Recorded even when the product has no price rows, so an empty capture is fresh too.
        if let Err(err) = self
            .store
            .mark_refreshed(product_id, &currency.to_uppercase(), captured_at)
            .await
        {
            warn!(target = "resale.market", product_id, error = %err, "refresh marker not saved");
            warnings.push(format!("refresh time not recorded: {err}"));
        }
        if let Err(err) = self.store.refresh_latest_projection().await {
            warn!(target = "resale.market", product_id, error = %err, "latest price projection refresh failed");
            warnings.push(format!("latest price projection not refreshed: {err}"));
        }
        info!(
            target = "resale.market",
            product_id,
            currency,
            snapshots = snapshots.len(),
            "market data captured"
        );
        Ok(Capture {
            snapshots,
            warnings,
        })
    }

    /// Newest snapshot per variant, straight from the snapshot history.
    pub async fn latest_snapshots(
        &self,
        product_id: &str,
        currency: &str,
    ) -> Result<Vec<MarketSnapshot>, SyncError> {
        Ok(self
            .store
            .latest_snapshots(product_id, &currency.to_uppercase())
            .await?)
    }

    async fn cached(&self, product_id: &str, currency: &str, warnings: &mut Vec<String>) -> Vec<MarketSnapshot> {
        match self.store.latest_snapshots(product_id, currency).await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warnings.push(format!("reading cached snapshots failed: {err}"));
                Vec::new()
            }
        }
    }

    async fn flight(&self, key: &FlightKey) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the map entry once the last caller of this flight is done with it.
    async fn land(&self, key: &FlightKey, flight: Arc<Mutex<()>>) {
        let mut flights = self.flights.lock().await;
        if let Some(entry) = flights.get(key)
            && Arc::ptr_eq(entry, &flight)
            && Arc::strong_count(&flight) == 2
        {
            flights.remove(key);
        }
    }

    #[cfg(test)]
    async fn flights_in_use(&self) -> usize {
        self.flights.lock().await.len()
    }
}

fn is_fresh(latest: Option<DateTime<Utc>>, now: DateTime<Utc>, ttl: Duration) -> bool {
    latest.is_some_and(|at| now - at <= ttl)
}

#[async_trait]
impl RegionRefresher for MarketRefresher {
    async fn refresh_region(&self, product_id: &str, currency: &str, ttl: Duration) -> FreshnessReport {
        self.ensure_fresh(product_id, currency, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;
    use crate::marketplace::MockMarketplaceClient;
    use crate::marketplace::mock::{MockCall, MockFailure};
    use crate::marketplace::wire::VariantMarketData;
    use crate::store::{MarketStore, MemoryStore};

    async fn setup() -> (Arc<MemoryStore>, Arc<MockMarketplaceClient>, Arc<MarketRefresher>) {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockMarketplaceClient::new());
        mock.add_product("P", "SKU-1", "Runner", &["9", "10"]).await;
        mock.set_market_data(
            "P",
            "USD",
            vec![
                VariantMarketData {
                    variant_id: "P-9".into(),
                    currency: "USD".into(),
                    lowest_ask: Some(200.0),
                    highest_bid: Some(170.0),
                },
                VariantMarketData {
                    variant_id: "P-10".into(),
                    currency: "USD".into(),
                    lowest_ask: Some(210.0),
                    highest_bid: None,
                },
            ],
        )
        .await;
        let mut config = SyncConfig::default();
        config.region_delay = std::time::Duration::from_millis(1);
        let (regions, _worker) = RegionQueue::spawn(config.region_delay);
        let refresher = Arc::new(MarketRefresher::new(
            store.clone(),
            mock.clone(),
            regions,
            &config,
        ));
        (store, mock, refresher)
    }

    #[tokio::test]
    async fn second_call_within_ttl_does_not_refetch() {
        let (store, mock, refresher) = setup().await;
        let first = refresher.ensure_fresh("P", "usd", Duration::minutes(30)).await;
        assert!(first.refreshed);
        assert_eq!(first.snapshots.len(), 2);
        assert_eq!(store.variants().await.len(), 2);

        let second = refresher.ensure_fresh("P", "USD", Duration::minutes(30)).await;
        assert!(!second.refreshed);
        assert!(!second.stale);
        assert_eq!(second.snapshots.len(), 2);
        assert_eq!(mock.calls(MockCall::MarketData).await, 1);
        assert_eq!(store.snapshots().await.len(), 2);
    }

    #[tokio::test]
    async fn empty_capture_still_counts_as_fresh() {
        let (store, mock, refresher) = setup().await;
        mock.add_product("EMPTY", "SKU-0", "No sizes yet", &[]).await;

        let first = refresher.ensure_fresh("EMPTY", "USD", Duration::minutes(30)).await;
        assert!(first.refreshed);
        assert!(first.snapshots.is_empty());
        let second = refresher.ensure_fresh("EMPTY", "USD", Duration::minutes(30)).await;
        assert!(!second.refreshed);
        assert!(!second.stale);
        assert_eq!(mock.calls(MockCall::MarketData).await, 1);
        assert!(store.latest_capture("EMPTY", "USD").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn flight_entries_are_dropped_after_use() {
        let (_store, _mock, refresher) = setup().await;
        let mut handles = Vec::new();
        for currency in ["USD", "EUR", "USD"] {
            let refresher = refresher.clone();
            handles.push(tokio::spawn(async move {
                refresher.ensure_fresh("P", currency, Duration::minutes(30)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(refresher.flights_in_use().await, 0);
    }

    #[tokio::test]
    async fn expired_ttl_appends_new_snapshots() {
        let (store, mock, refresher) = setup().await;
        refresher.ensure_fresh("P", "USD", Duration::minutes(30)).await;
        let again = refresher.ensure_fresh("P", "USD", Duration::zero()).await;
        assert!(again.refreshed);
        assert_eq!(mock.calls(MockCall::MarketData).await, 2);
        assert_eq!(store.snapshots().await.len(), 4);
    }

    #[tokio::test]
    async fn remote_failure_serves_stale_cache() {
        let (_store, mock, refresher) = setup().await;
        refresher.ensure_fresh("P", "USD", Duration::minutes(30)).await;
        mock.inject(MockCall::Variants, MockFailure::Transient).await;

        let report = refresher.ensure_fresh("P", "USD", Duration::zero()).await;
        assert!(report.stale);
        assert!(!report.refreshed);
        assert!(report.error.is_some());
        assert_eq!(report.snapshots.len(), 2);
    }

    #[tokio::test]
    async fn projection_failure_is_reported() {
        let (store, _mock, refresher) = setup().await;
        store.set_projection_available(false).await;

        let report = refresher.ensure_fresh("P", "USD", Duration::minutes(30)).await;
        assert!(report.refreshed);
        assert_eq!(report.warnings.len(), 1);
        assert!(store.projection_entry("P", "P-9", "USD").await.is_none());

        store.set_projection_available(true).await;
        let report = refresher.ensure_fresh("P", "USD", Duration::zero()).await;
        assert!(report.warnings.is_empty());
        assert_eq!(
            store.projection_entry("P", "P-9", "USD").await.unwrap().lowest_ask,
            Some(200.0)
        );
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let (_store, mock, refresher) = setup().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let refresher = refresher.clone();
            handles.push(tokio::spawn(async move {
                refresher.ensure_fresh("P", "USD", Duration::minutes(30)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(mock.calls(MockCall::MarketData).await, 1);
    }

    #[tokio::test]
    async fn secondary_regions_run_in_background() {
        let (_store, mock, refresher) = setup().await;
        let result = refresher
            .ensure_fresh_regions("P", "USD", &["EUR".into(), "GBP".into()], Duration::minutes(30))
            .await;
        assert!(result.primary.refreshed);
        let job_id = result.job_id.unwrap();

        let mut state = None;
        for _ in 0..100 {
            let info = refresher.regions.get(job_id).await.unwrap();
            if matches!(info.state, JobState::Completed { .. }) {
                state = Some(info.state);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let Some(JobState::Completed { regions }) = state else {
            panic!("region job did not complete");
        };
        assert_eq!(regions.len(), 2);
        assert_eq!(mock.calls(MockCall::MarketData).await, 3);
    }

    #[tokio::test]
    async fn failed_primary_skips_secondaries() {
        let (_store, mock, refresher) = setup().await;
        mock.inject(MockCall::Variants, MockFailure::Transient).await;
        let result = refresher
            .ensure_fresh_regions("P", "USD", &["EUR".into()], Duration::minutes(30))
            .await;
        assert!(result.primary.stale);
        assert!(result.job_id.is_none());
    }
}
