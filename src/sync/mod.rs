pub mod batch;
pub mod market;
pub mod operations;
pub mod reconcile;
pub mod scheduler;

use crate::config::SyncConfig;
use crate::jobs::RegionQueue;
use crate::marketplace::auth::AuthError;
use crate::marketplace::wire::OrderPage;
use crate::marketplace::{MarketplaceClient, RequestError, TokenManager};
use crate::models::CredentialScope;
use crate::store::{StoreError, SyncStore};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use batch::{BatchSummary, BatchWorker};
pub use market::{FreshnessReport, MarketRefresher};
pub use operations::{Mutation, OperationTracker, PollSummary, SubmitReceipt};
pub use reconcile::{ListingsReconciler, ReconcileMode, ReconcileSummary};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Largest order page the marketplace serves in one call.
const MAX_ORDER_PAGE_SIZE: u32 = 100;

/// Every engine component, wired against one store and one marketplace provider.
#[derive(Clone)]
pub struct SyncEngine {
    pub tracker: Arc<OperationTracker>,
    pub reconciler: Arc<ListingsReconciler>,
    pub market: Arc<MarketRefresher>,
    pub batch: Arc<BatchWorker>,
    pub regions: RegionQueue,
    store: Arc<dyn SyncStore>,
    client: Arc<dyn MarketplaceClient>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn SyncStore>,
        client: Arc<dyn MarketplaceClient>,
        tokens: Arc<TokenManager>,
        config: &SyncConfig,
    ) -> Self {
        let (regions, _worker) = RegionQueue::spawn(config.region_delay);
        let market = Arc::new(MarketRefresher::new(
            store.clone(),
            client.clone(),
            regions.clone(),
            config,
        ));
        Self {
            tracker: Arc::new(OperationTracker::new(
                store.clone(),
                client.clone(),
                tokens,
                config,
            )),
            reconciler: Arc::new(ListingsReconciler::new(store.clone(), client.clone(), config)),
            batch: Arc::new(BatchWorker::new(
                store.clone(),
                client.clone(),
                market.clone(),
                config,
            )),
            market,
            regions,
            store,
            client,
        }
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// One page of the seller's marketplace orders, read through to the provider.
    pub async fn recent_orders(
        &self,
        seller_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<OrderPage, SyncError> {
        let page_size = page_size.clamp(1, MAX_ORDER_PAGE_SIZE);
        let orders = self
            .client
            .list_orders(CredentialScope::Seller(seller_id), page.max(1), page_size)
            .await?;
        Ok(orders)
    }
}
