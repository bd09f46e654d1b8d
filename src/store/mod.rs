//! Narrow persistence interface used by every engine component.
//!
//! Writes are upserts keyed by natural keys (local item id, operation id, variant id,
//! job id). Where two writers can race on one row the write is conditional on what the
//! writer last read: operations only change while non-terminal, reconciled mappings
//! only change while `updated_at` is the value that was compared, and job claims only
//! win rows that are still claimable. Snapshots are append-only.

pub mod memory;
pub mod postgrest;

use crate::models::{
    CatalogVariant, Credential, CredentialScope, ListingHistoryEntry, ListingMapping,
    ListingStatus, MarketSnapshot, Operation, SyncJob,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgrest::PostgrestStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
    #[error("invalid store response: {0}")]
    Deserialize(String),
    #[error("projection refresh failed: {0}")]
    Projection(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_credential(&self, scope: CredentialScope) -> StoreResult<Option<Credential>>;

    /// Replaces the whole row, so a rotated refresh token lands together with its access token.
    async fn save_credential(&self, credential: &Credential) -> StoreResult<()>;

    async fn mark_connection_broken(
        &self,
        seller_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn delete_credential(&self, scope: CredentialScope) -> StoreResult<()>;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn get_mapping(&self, local_item_id: Uuid) -> StoreResult<Option<ListingMapping>>;

    /// Mappings of `seller_id` that reference a remote listing, optionally narrowed by status.
    async fn mappings_with_remote_listing(
        &self,
        seller_id: Uuid,
        statuses: Option<&[ListingStatus]>,
    ) -> StoreResult<Vec<ListingMapping>>;

    async fn upsert_mappings(&self, mappings: &[ListingMapping]) -> StoreResult<()>;

    /// Replaces the stored row only if its `updated_at` still equals `read_at`.
    /// Returns false when another writer got there first.
    async fn update_mapping_if(
        &self,
        mapping: &ListingMapping,
        read_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Sets `last_sync_at` on the given mappings and nothing else.
    async fn touch_mappings(&self, local_item_ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<()>;

    async fn append_history(&self, entry: &ListingHistoryEntry) -> StoreResult<()>;
}

#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn insert_operation(&self, operation: &Operation) -> StoreResult<()>;

    async fn get_operation(&self, operation_id: &str) -> StoreResult<Option<Operation>>;

    /// Writes `operation` only while the stored row is still queued or processing.
    /// Returns false when the row is already terminal, i.e. another poller finished it.
    async fn update_operation(&self, operation: &Operation) -> StoreResult<bool>;

    /// Non-terminal operations started before `started_before`.
    async fn stale_operations(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Operation>>;

    /// Non-terminal operations never polled or last polled before `polled_before`,
    /// started at or after `started_after`. Least recently polled first.
    async fn due_operations(
        &self,
        polled_before: DateTime<Utc>,
        started_after: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Operation>>;
}

#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn upsert_variants(&self, variants: &[CatalogVariant]) -> StoreResult<()>;

    /// When `product_id` was last refreshed in `currency`, whether or not the refresh
    /// produced any snapshot rows.
    async fn latest_capture(
        &self,
        product_id: &str,
        currency: &str,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    async fn mark_refreshed(
        &self,
        product_id: &str,
        currency: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn insert_snapshots(&self, snapshots: &[MarketSnapshot]) -> StoreResult<()>;

    /// Newest snapshot per variant, read from history rather than the projection.
    async fn latest_snapshots(
        &self,
        product_id: &str,
        currency: &str,
    ) -> StoreResult<Vec<MarketSnapshot>>;

    /// Rebuilds the derived "latest price" projection. Not maintained automatically.
    async fn refresh_latest_projection(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue_jobs(&self, jobs: &[SyncJob]) -> StoreResult<()>;

    /// Moves up to `limit` claimable jobs of `seller_id` to processing, oldest first.
    /// Claimable means pending, deferred, or processing with `updated_at` before
    /// `lease_expired_before` (a claim whose run never finished).
    async fn claim_jobs(
        &self,
        seller_id: Uuid,
        limit: usize,
        lease_expired_before: DateTime<Utc>,
    ) -> StoreResult<Vec<SyncJob>>;

    async fn save_job(&self, job: &SyncJob) -> StoreResult<()>;

    /// Sellers that have claimable jobs, by the same rule as `claim_jobs`.
    async fn sellers_with_jobs(&self, lease_expired_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;
}

pub trait SyncStore: CredentialStore + ListingStore + OperationStore + MarketStore + JobStore {}

impl<T> SyncStore for T where
    T: CredentialStore + ListingStore + OperationStore + MarketStore + JobStore
{
}
