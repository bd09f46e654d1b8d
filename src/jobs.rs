use crate::{models::ApiError, sync::market::FreshnessReport};
use async_trait::async_trait;
use chrono::Duration;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Refreshes one (product, currency) pair. Implemented by the market refresher.
#[async_trait]
pub trait RegionRefresher: Send + Sync {
    async fn refresh_region(&self, product_id: &str, currency: &str, ttl: Duration)
    -> FreshnessReport;
}

/// Background queue for secondary-region market refreshes. One worker drains it and
/// waits `delay` before each region so regions never burst the remote rate limit.
#[derive(Clone)]
pub struct RegionQueue {
    tx: mpsc::Sender<RegionJob>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

struct RegionJob {
    id: Uuid,
    product_id: String,
    currencies: Vec<String>,
    ttl: Duration,
    refresher: Arc<dyn RegionRefresher>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegionOutcome {
    pub currency: String,
    pub refreshed: bool,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running {
        product_id: String,
        done: usize,
        total: usize,
    },
    Completed {
        regions: Vec<RegionOutcome>,
    },
    Failed {
        error: String,
        regions: Vec<RegionOutcome>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl RegionQueue {
    pub fn spawn(delay: std::time::Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RegionJob>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let total = job.currencies.len();
                let mut regions = Vec::with_capacity(total);
                for currency in &job.currencies {
                    {
                        let mut guard = statuses_bg.lock().await;
                        guard.insert(
                            job.id,
                            JobState::Running {
                                product_id: job.product_id.clone(),
                                done: regions.len(),
                                total,
                            },
                        );
                    }
                    tokio::time::sleep(delay).await;
                    let report = job
                        .refresher
                        .refresh_region(&job.product_id, currency, job.ttl)
                        .await;
                    if let Some(error) = &report.error {
                        warn!(
                            target = "resale.jobs",
                            job_id = %job.id,
                            product_id = %job.product_id,
                            %currency,
                            %error,
                            "region refresh failed"
                        );
                    }
                    regions.push(RegionOutcome {
                        currency: report.currency,
                        refreshed: report.refreshed,
                        stale: report.stale,
                        error: report.error,
                        warnings: report.warnings,
                    });
                }

                let failures = regions.iter().filter(|r| r.error.is_some()).count();
                info!(
                    target = "resale.jobs",
                    job_id = %job.id,
                    product_id = %job.product_id,
                    regions = total,
                    failures,
                    "region refresh finished"
                );
                let state = if total > 0 && failures == total {
                    JobState::Failed {
                        error: "every region failed".into(),
                        regions,
                    }
                } else {
                    JobState::Completed { regions }
                };
                statuses_bg.lock().await.insert(job.id, state);
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue(
        &self,
        product_id: String,
        currencies: Vec<String>,
        ttl: Duration,
        refresher: Arc<dyn RegionRefresher>,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, JobState::Queued);
        }
        let job = RegionJob {
            id,
            product_id,
            currencies,
            ttl,
            refresher,
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("region worker not available".into()),
            });
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("REGION_QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
