use crate::config::SyncConfig;
use crate::marketplace::wire::CatalogProduct;
use crate::marketplace::{MarketplaceClient, RetryPolicy};
use crate::models::{CatalogVariant, CredentialScope, SyncJob, SyncJobStatus};
use crate::store::SyncStore;
use crate::sync::SyncError;
use crate::sync::market::MarketRefresher;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
    pub processed: usize,
}

impl BatchSummary {
    fn absorb(&mut self, other: &BatchSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.processed += other.processed;
    }
}

/// Keeps consecutive remote calls at least `spacing` apart, whatever they returned.
struct Pacer {
    spacing: Duration,
    last: Option<Instant>,
}

impl Pacer {
    fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last: None,
        }
    }

    async fn wait(&mut self) {
        if let Some(last) = self.last {
            tokio::time::sleep_until(last + self.spacing).await;
        }
        self.last = Some(Instant::now());
    }
}

/// Consumes a seller's sync jobs one at a time against the remote catalog.
pub struct BatchWorker {
    store: Arc<dyn SyncStore>,
    client: Arc<dyn MarketplaceClient>,
    market: Arc<MarketRefresher>,
    policy: RetryPolicy,
    call_spacing: Duration,
    default_limit: usize,
    job_lease: ChronoDuration,
    currency: String,
}

impl BatchWorker {
    pub fn new(
        store: Arc<dyn SyncStore>,
        client: Arc<dyn MarketplaceClient>,
        market: Arc<MarketRefresher>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            client,
            market,
            policy: RetryPolicy::from_config(config).no_rate_limit_retry(),
            call_spacing: config.batch_call_spacing,
            default_limit: config.batch_limit,
            job_lease: config.job_lease,
            currency: config.primary_currency.clone(),
        }
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Claims older than this belong to a run that never finished.
    fn lease_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.job_lease
    }

    pub async fn run_batch(&self, seller_id: Uuid, limit: usize) -> Result<BatchSummary, SyncError> {
        let jobs = self
            .store
            .claim_jobs(seller_id, limit, self.lease_cutoff())
            .await?;
        let mut summary = BatchSummary {
            processed: jobs.len(),
            ..BatchSummary::default()
        };
        let mut pacer = Pacer::new(self.call_spacing);

        for (index, job) in jobs.iter().enumerate() {
            match self.process(job, &mut pacer).await {
                Ok(()) => {
                    self.finish(job, SyncJobStatus::Done, None).await;
                    summary.succeeded += 1;
                }
                Err(SyncError::Request(err)) if err.is_rate_limited() => {
                    warn!(
                        target = "resale.batch",
                        %seller_id,
                        job_id = %job.job_id,
                        remaining = jobs.len() - index,
                        "rate limited, deferring the rest of the batch"
                    );
                    for rest in &jobs[index..] {
                        self.finish(rest, SyncJobStatus::Deferred, Some(err.to_string()))
                            .await;
                        summary.deferred += 1;
                    }
                    break;
                }
                Err(err) => {
                    warn!(
                        target = "resale.batch",
                        %seller_id,
                        job_id = %job.job_id,
                        sku = %job.sku,
                        error = %err,
                        "sync job failed"
                    );
                    self.finish(job, SyncJobStatus::Failed, Some(err.to_string()))
                        .await;
                    summary.failed += 1;
                }
            }
        }

        info!(
            target = "resale.batch",
            %seller_id,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            deferred = summary.deferred,
            "batch finished"
        );
        Ok(summary)
    }

    /// One batch per seller with eligible jobs, sellers in parallel.
    pub async fn run_all(self: &Arc<Self>, limit: usize) -> Result<BatchSummary, SyncError> {
        let sellers = self.store.sellers_with_jobs(self.lease_cutoff()).await?;
        let mut set = JoinSet::new();
        for seller_id in sellers {
            let worker = self.clone();
            set.spawn(async move { (seller_id, worker.run_batch(seller_id, limit).await) });
        }
        let mut total = BatchSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(summary))) => total.absorb(&summary),
                Ok((seller_id, Err(err))) => {
                    warn!(target = "resale.batch", %seller_id, error = %err, "seller batch aborted");
                }
                Err(err) => warn!(target = "resale.batch", error = %err, "batch task panicked"),
            }
        }
        Ok(total)
    }

    async fn process(&self, job: &SyncJob, pacer: &mut Pacer) -> Result<(), SyncError> {
        let scope = CredentialScope::Application;

        pacer.wait().await;
        let products = self
            .client
            .search_catalog(scope, &job.sku, Some(&self.policy))
            .await?;
        let product = pick_product(&products, &job.sku)
            .ok_or_else(|| SyncError::NotFound(format!("no catalog match for {}", job.sku)))?;

        pacer.wait().await;
        let variants = self
            .client
            .list_variants(scope, &product.product_id, Some(&self.policy))
            .await?;
        self.store.upsert_variants(&variants).await?;
        if let Some(size) = job.size.as_deref()
            && pick_variant(&variants, size).is_none()
        {
            return Err(SyncError::NotFound(format!(
                "{} has no variant in size {size}",
                job.sku
            )));
        }

        pacer.wait().await;
        let capture = self
            .market
            .capture(&product.product_id, &self.currency, Some(&self.policy))
            .await?;
        for warning in capture.warnings {
            warn!(target = "resale.batch", job_id = %job.job_id, %warning, "price capture warning");
        }
        Ok(())
    }

    /// A job whose outcome cannot be saved stays claimed and is picked up again once
    /// its lease runs out, so the rest of the batch carries on.
    async fn finish(&self, job: &SyncJob, status: SyncJobStatus, error: Option<String>) {
        let mut job = job.clone();
        if status == SyncJobStatus::Failed {
            job.retry_count += 1;
        }
        job.status = status;
        job.last_error = error;
        job.updated_at = Utc::now();
        if let Err(err) = self.store.save_job(&job).await {
            warn!(
                target = "resale.batch",
                job_id = %job.job_id,
                status = status.as_str(),
                error = %err,
                "job outcome not saved; it will be retried after the lease"
            );
        }
    }
}

/// Exact style-id match first, then the top search hit.
fn pick_product<'a>(products: &'a [CatalogProduct], sku: &str) -> Option<&'a CatalogProduct> {
    products
        .iter()
        .find(|p| {
            p.style_id
                .as_deref()
                .is_some_and(|style| style.eq_ignore_ascii_case(sku.trim()))
        })
        .or_else(|| products.first())
}

fn pick_variant<'a>(variants: &'a [CatalogVariant], size: &str) -> Option<&'a CatalogVariant> {
    let wanted = normalize_size(size);
    variants
        .iter()
        .find(|v| v.size.as_deref().map(normalize_size).as_deref() == Some(wanted.as_str()))
}

fn normalize_size(size: &str) -> String {
    let trimmed = size.trim().to_uppercase();
    trimmed
        .strip_prefix("US")
        .map(str::trim)
        .unwrap_or(&trimmed)
        .trim_end_matches('M')
        .to_string()
}
