use super::{
    CredentialStore, JobStore, ListingStore, MarketStore, OperationStore, StoreError, StoreResult,
};
use crate::models::{
    CatalogVariant, Credential, CredentialScope, ListingHistoryEntry, ListingMapping,
    ListingStatus, MarketSnapshot, Operation, SyncJob, SyncJobStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-process store used in mock mode and by tests.
///
/// The "latest price" projection is kept as a separate map that only changes when
/// `refresh_latest_projection` runs, the same way a materialized view behaves.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    credentials: HashMap<CredentialScope, Credential>,
    mappings: HashMap<Uuid, ListingMapping>,
    history: Vec<ListingHistoryEntry>,
    operations: HashMap<String, Operation>,
    variants: HashMap<String, CatalogVariant>,
    snapshots: Vec<MarketSnapshot>,
    projection: HashMap<(String, String, String), MarketSnapshot>,
    projection_unavailable: bool,
    refreshes: HashMap<(String, String), DateTime<Utc>>,
    jobs: Vec<SyncJob>,
    failing_mapping_writes: usize,
    failing_job_saves: usize,
    credential_saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` mapping writes (upserts or conditional updates) fail.
    pub async fn fail_next_mapping_writes(&self, count: usize) {
        self.state.lock().await.failing_mapping_writes = count;
    }

    /// Makes the next `count` calls to `save_job` fail.
    pub async fn fail_next_job_saves(&self, count: usize) {
        self.state.lock().await.failing_job_saves = count;
    }

    pub async fn set_projection_available(&self, available: bool) {
        self.state.lock().await.projection_unavailable = !available;
    }

    pub async fn history(&self) -> Vec<ListingHistoryEntry> {
        self.state.lock().await.history.clone()
    }

    pub async fn snapshots(&self) -> Vec<MarketSnapshot> {
        self.state.lock().await.snapshots.clone()
    }

    pub async fn variants(&self) -> Vec<CatalogVariant> {
        let mut out: Vec<_> = self.state.lock().await.variants.values().cloned().collect();
        out.sort_by(|a, b| a.variant_id.cmp(&b.variant_id));
        out
    }

    pub async fn projection_entry(
        &self,
        product_id: &str,
        variant_id: &str,
        currency: &str,
    ) -> Option<MarketSnapshot> {
        self.state
            .lock()
            .await
            .projection
            .get(&(product_id.to_string(), variant_id.to_string(), currency.to_string()))
            .cloned()
    }

    pub async fn jobs(&self) -> Vec<SyncJob> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn credential_saves(&self) -> usize {
        self.state.lock().await.credential_saves
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load_credential(&self, scope: CredentialScope) -> StoreResult<Option<Credential>> {
        Ok(self.state.lock().await.credentials.get(&scope).cloned())
    }

    async fn save_credential(&self, credential: &Credential) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.credential_saves += 1;
        state
            .credentials
            .insert(credential.scope, credential.clone());
        Ok(())
    }

    async fn mark_connection_broken(
        &self,
        seller_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(credential) = state.credentials.get_mut(&CredentialScope::Seller(seller_id)) {
            credential.connection_broken_at = Some(at);
            credential.broken_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn delete_credential(&self, scope: CredentialScope) -> StoreResult<()> {
        self.state.lock().await.credentials.remove(&scope);
        Ok(())
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn get_mapping(&self, local_item_id: Uuid) -> StoreResult<Option<ListingMapping>> {
        Ok(self.state.lock().await.mappings.get(&local_item_id).cloned())
    }

    async fn mappings_with_remote_listing(
        &self,
        seller_id: Uuid,
        statuses: Option<&[ListingStatus]>,
    ) -> StoreResult<Vec<ListingMapping>> {
        let state = self.state.lock().await;
        let mut out: Vec<ListingMapping> = state
            .mappings
            .values()
            .filter(|m| m.seller_id == seller_id && m.remote_listing_id.is_some())
            .filter(|m| statuses.is_none_or(|allowed| allowed.contains(&m.listing_status)))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.local_item_id);
        Ok(out)
    }

    async fn upsert_mappings(&self, mappings: &[ListingMapping]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.injected_mapping_failure()?;
        for mapping in mappings {
            state.mappings.insert(mapping.local_item_id, mapping.clone());
        }
        Ok(())
    }

    async fn update_mapping_if(
        &self,
        mapping: &ListingMapping,
        read_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.injected_mapping_failure()?;
        match state.mappings.get_mut(&mapping.local_item_id) {
            Some(stored) if stored.updated_at == read_at => {
                *stored = mapping.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_mappings(&self, local_item_ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.injected_mapping_failure()?;
        for id in local_item_ids {
            if let Some(stored) = state.mappings.get_mut(id) {
                stored.last_sync_at = Some(at);
            }
        }
        Ok(())
    }

    async fn append_history(&self, entry: &ListingHistoryEntry) -> StoreResult<()> {
        self.state.lock().await.history.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn insert_operation(&self, operation: &Operation) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .operations
            .entry(operation.operation_id.clone())
            .or_insert_with(|| operation.clone());
        Ok(())
    }

    async fn get_operation(&self, operation_id: &str) -> StoreResult<Option<Operation>> {
        Ok(self.state.lock().await.operations.get(operation_id).cloned())
    }

    async fn update_operation(&self, operation: &Operation) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.operations.get_mut(&operation.operation_id) {
            Some(stored) if stored.status.is_terminal() => Ok(false),
            Some(stored) => {
                *stored = operation.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stale_operations(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Operation>> {
        let state = self.state.lock().await;
        let mut out: Vec<Operation> = state
            .operations
            .values()
            .filter(|op| !op.status.is_terminal() && op.started_at < started_before)
            .cloned()
            .collect();
        out.sort_by_key(|op| op.started_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn due_operations(
        &self,
        polled_before: DateTime<Utc>,
        started_after: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Operation>> {
        let state = self.state.lock().await;
        let mut out: Vec<Operation> = state
            .operations
            .values()
            .filter(|op| !op.status.is_terminal())
            .filter(|op| op.started_at >= started_after)
            .filter(|op| op.last_polled_at.is_none_or(|at| at < polled_before))
            .cloned()
            .collect();
        out.sort_by_key(|op| (op.last_polled_at, op.started_at));
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn upsert_variants(&self, variants: &[CatalogVariant]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for variant in variants {
            state
                .variants
                .insert(variant.variant_id.clone(), variant.clone());
        }
        Ok(())
    }

    async fn latest_capture(
        &self,
        product_id: &str,
        currency: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        let marker = state
            .refreshes
            .get(&(product_id.to_string(), currency.to_string()))
            .copied();
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.product_id == product_id && s.currency == currency)
            .map(|s| s.captured_at)
            .chain(marker)
            .max())
    }

    async fn mark_refreshed(
        &self,
        product_id: &str,
        currency: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .refreshes
            .insert((product_id.to_string(), currency.to_string()), at);
        Ok(())
    }

    async fn insert_snapshots(&self, snapshots: &[MarketSnapshot]) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .snapshots
            .extend(snapshots.iter().cloned());
        Ok(())
    }

    async fn latest_snapshots(
        &self,
        product_id: &str,
        currency: &str,
    ) -> StoreResult<Vec<MarketSnapshot>> {
        let state = self.state.lock().await;
        let mut latest: HashMap<&str, &MarketSnapshot> = HashMap::new();
        for snapshot in state
            .snapshots
            .iter()
            .filter(|s| s.product_id == product_id && s.currency == currency)
        {
            let slot = latest.entry(snapshot.variant_id.as_str()).or_insert(snapshot);
            if snapshot.captured_at > slot.captured_at {
                *slot = snapshot;
            }
        }
        let mut out: Vec<MarketSnapshot> = latest.into_values().cloned().collect();
        out.sort_by(|a, b| a.variant_id.cmp(&b.variant_id));
        Ok(out)
    }

    async fn refresh_latest_projection(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.projection_unavailable {
            return Err(StoreError::Projection(
                "refresh_market_latest_prices is not installed".into(),
            ));
        }
        let mut projection: HashMap<(String, String, String), MarketSnapshot> = HashMap::new();
        for snapshot in &state.snapshots {
            let key = (
                snapshot.product_id.clone(),
                snapshot.variant_id.clone(),
                snapshot.currency.clone(),
            );
            match projection.get(&key) {
                Some(existing) if existing.captured_at >= snapshot.captured_at => {}
                _ => {
                    projection.insert(key, snapshot.clone());
                }
            }
        }
        state.projection = projection;
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue_jobs(&self, jobs: &[SyncJob]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for job in jobs {
            if !state.jobs.iter().any(|j| j.job_id == job.job_id) {
                state.jobs.push(job.clone());
            }
        }
        Ok(())
    }

    async fn claim_jobs(
        &self,
        seller_id: Uuid,
        limit: usize,
        lease_expired_before: DateTime<Utc>,
    ) -> StoreResult<Vec<SyncJob>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut claimed = Vec::new();
        for job in state.jobs.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if job.seller_id == seller_id && claimable(job, lease_expired_before) {
                job.status = SyncJobStatus::Processing;
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn save_job(&self, job: &SyncJob) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.failing_job_saves > 0 {
            state.failing_job_saves -= 1;
            return Err(StoreError::Request("injected job save failure".into()));
        }
        match state.jobs.iter_mut().find(|j| j.job_id == job.job_id) {
            Some(existing) => *existing = job.clone(),
            None => state.jobs.push(job.clone()),
        }
        Ok(())
    }

    async fn sellers_with_jobs(&self, lease_expired_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut sellers: Vec<Uuid> = state
            .jobs
            .iter()
            .filter(|j| claimable(j, lease_expired_before))
            .map(|j| j.seller_id)
            .collect();
        sellers.sort();
        sellers.dedup();
        Ok(sellers)
    }
}

impl MemoryState {
    fn injected_mapping_failure(&mut self) -> StoreResult<()> {
        if self.failing_mapping_writes > 0 {
            self.failing_mapping_writes -= 1;
            return Err(StoreError::Request("injected mapping write failure".into()));
        }
        Ok(())
    }
}

fn claimable(job: &SyncJob, lease_expired_before: DateTime<Utc>) -> bool {
    match job.status {
        SyncJobStatus::Pending | SyncJobStatus::Deferred => true,
        SyncJobStatus::Processing => job.updated_at < lease_expired_before,
        _ => false,
    }
}
