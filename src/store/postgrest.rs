use super::{
    CredentialStore, JobStore, ListingStore, MarketStore, OperationStore, StoreError, StoreResult,
};
use crate::http::build_client;
use crate::models::{
    CatalogVariant, Credential, CredentialScope, ListingHistoryEntry, ListingMapping,
    ListingStatus, MarketSnapshot, Operation, SyncJob,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::collections::HashSet;
use tracing::debug;
use urlencoding::encode;
use uuid::Uuid;

/// Upper bound on snapshot rows scanned when picking the newest price per variant.
const LATEST_SCAN_LIMIT: usize = 1000;

/// Store backed by a PostgREST endpoint (Supabase or plain PostgREST).
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialRow {
    scope_key: String,
    seller_id: Option<Uuid>,
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
    connection_broken_at: Option<DateTime<Utc>>,
    broken_reason: Option<String>,
}

impl From<&Credential> for CredentialRow {
    fn from(credential: &Credential) -> Self {
        Self {
            scope_key: credential.scope.to_string(),
            seller_id: credential.scope.seller_id(),
            access_token: credential.access_token.clone(),
            refresh_token: credential.refresh_token.clone(),
            expires_at: credential.expires_at,
            connection_broken_at: credential.connection_broken_at,
            broken_reason: credential.broken_reason.clone(),
        }
    }
}

impl CredentialRow {
    fn into_credential(self) -> Credential {
        let scope = match self.seller_id {
            Some(id) => CredentialScope::Seller(id),
            None => CredentialScope::Application,
        };
        Credential {
            scope,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_at,
            connection_broken_at: self.connection_broken_at,
            broken_reason: self.broken_reason,
        }
    }
}

#[derive(Deserialize)]
struct CaptureRow {
    captured_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct SellerRow {
    seller_id: Uuid,
}

#[derive(Serialize, Deserialize)]
struct RefreshRow {
    product_id: String,
    currency: String,
    refreshed_at: DateTime<Utc>,
}

/// Keeps only the rows a conditional PATCH actually changed.
#[derive(Deserialize)]
struct Touched {}

/// Pending or deferred, or processing under a claim older than the lease.
fn claimable_filter(lease_expired_before: DateTime<Utc>) -> String {
    format!(
        "or=(status.in.(pending,deferred),and(status.eq.processing,updated_at.lt.{}))",
        ts(lease_expired_before)
    )
}

fn ts(at: DateTime<Utc>) -> String {
    encode(&at.to_rfc3339_opts(SecondsFormat::Micros, true)).into_owned()
}

fn status_list(statuses: &[ListingStatus]) -> String {
    statuses
        .iter()
        .map(ListingStatus::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

impl PostgrestStore {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(base_url, service_key))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/rest/v1/{}", self.base_url, path);
        debug!(target = "resale.store", %method, %url, "postgrest request");
        self.http
            .request(method, url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, builder: RequestBuilder) -> StoreResult<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Request(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }

    async fn select<T: DeserializeOwned>(&self, path: &str) -> StoreResult<Vec<T>> {
        self.send(self.request(Method::GET, path))
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn upsert<T: Serialize + ?Sized>(
        &self,
        table: &str,
        on_conflict: &str,
        rows: &T,
    ) -> StoreResult<()> {
        let builder = self
            .request(Method::POST, &format!("{table}?on_conflict={on_conflict}"))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        self.send(builder).await.map(|_| ())
    }

    async fn insert<T: Serialize + ?Sized>(&self, table: &str, rows: &T, prefer: &str) -> StoreResult<()> {
        let builder = self
            .request(Method::POST, table)
            .header("Prefer", prefer)
            .json(rows);
        self.send(builder).await.map(|_| ())
    }

    async fn patch<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> StoreResult<Vec<T>> {
        let builder = self
            .request(Method::PATCH, path)
            .header("Prefer", "return=representation")
            .json(&body);
        self.send(builder)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }
}

#[async_trait]
impl CredentialStore for PostgrestStore {
    async fn load_credential(&self, scope: CredentialScope) -> StoreResult<Option<Credential>> {
        let mut rows: Vec<CredentialRow> = self
            .select(&format!(
                "marketplace_credentials?scope_key=eq.{}&select=*&limit=1",
                encode(&scope.to_string())
            ))
            .await?;
        Ok(rows.pop().map(CredentialRow::into_credential))
    }

    async fn save_credential(&self, credential: &Credential) -> StoreResult<()> {
        let row = CredentialRow::from(credential);
        self.upsert("marketplace_credentials", "scope_key", &[row])
            .await
    }

    async fn mark_connection_broken(
        &self,
        seller_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let scope = CredentialScope::Seller(seller_id).to_string();
        let _: Vec<serde_json::Value> = self
            .patch(
                &format!("marketplace_credentials?scope_key=eq.{}", encode(&scope)),
                json!({"connection_broken_at": at, "broken_reason": reason}),
            )
            .await?;
        Ok(())
    }

    async fn delete_credential(&self, scope: CredentialScope) -> StoreResult<()> {
        let path = format!(
            "marketplace_credentials?scope_key=eq.{}",
            encode(&scope.to_string())
        );
        self.send(self.request(Method::DELETE, &path)).await.map(|_| ())
    }
}

#[async_trait]
impl ListingStore for PostgrestStore {
    async fn get_mapping(&self, local_item_id: Uuid) -> StoreResult<Option<ListingMapping>> {
        let mut rows: Vec<ListingMapping> = self
            .select(&format!(
                "listing_mappings?local_item_id=eq.{local_item_id}&select=*&limit=1"
            ))
            .await?;
        Ok(rows.pop())
    }

    async fn mappings_with_remote_listing(
        &self,
        seller_id: Uuid,
        statuses: Option<&[ListingStatus]>,
    ) -> StoreResult<Vec<ListingMapping>> {
        let mut path = format!(
            "listing_mappings?seller_id=eq.{seller_id}&remote_listing_id=not.is.null&select=*&order=local_item_id.asc"
        );
        if let Some(statuses) = statuses {
            path.push_str(&format!("&listing_status=in.({})", status_list(statuses)));
        }
        self.select(&path).await
    }

    async fn upsert_mappings(&self, mappings: &[ListingMapping]) -> StoreResult<()> {
        if mappings.is_empty() {
            return Ok(());
        }
        self.upsert("listing_mappings", "local_item_id", mappings)
            .await
    }

    async fn update_mapping_if(
        &self,
        mapping: &ListingMapping,
        read_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let body = serde_json::to_value(mapping)
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        let rows: Vec<Touched> = self
            .patch(
                &format!(
                    "listing_mappings?local_item_id=eq.{}&updated_at=eq.{}",
                    mapping.local_item_id,
                    ts(read_at)
                ),
                body,
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn touch_mappings(&self, local_item_ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<()> {
        if local_item_ids.is_empty() {
            return Ok(());
        }
        let ids = local_item_ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let builder = self
            .request(Method::PATCH, &format!("listing_mappings?local_item_id=in.({ids})"))
            .header("Prefer", "return=minimal")
            .json(&json!({"last_sync_at": at}));
        self.send(builder).await.map(|_| ())
    }

    async fn append_history(&self, entry: &ListingHistoryEntry) -> StoreResult<()> {
        self.insert("listing_history", &[entry], "return=minimal")
            .await
    }
}

#[async_trait]
impl OperationStore for PostgrestStore {
    async fn insert_operation(&self, operation: &Operation) -> StoreResult<()> {
        let builder = self
            .request(Method::POST, "marketplace_operations?on_conflict=operation_id")
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(&[operation]);
        self.send(builder).await.map(|_| ())
    }

    async fn get_operation(&self, operation_id: &str) -> StoreResult<Option<Operation>> {
        let mut rows: Vec<Operation> = self
            .select(&format!(
                "marketplace_operations?operation_id=eq.{}&select=*&limit=1",
                encode(operation_id)
            ))
            .await?;
        Ok(rows.pop())
    }

    async fn update_operation(&self, operation: &Operation) -> StoreResult<bool> {
        let body = serde_json::to_value(operation)
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        let rows: Vec<Touched> = self
            .patch(
                &format!(
                    "marketplace_operations?operation_id=eq.{}&status=in.(queued,processing)",
                    encode(&operation.operation_id)
                ),
                body,
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn stale_operations(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Operation>> {
        self.select(&format!(
            "marketplace_operations?status=in.(queued,processing)&started_at=lt.{}&order=started_at.asc&limit={limit}",
            ts(started_before)
        ))
        .await
    }

    async fn due_operations(
        &self,
        polled_before: DateTime<Utc>,
        started_after: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Operation>> {
        self.select(&format!(
            "marketplace_operations?status=in.(queued,processing)&started_at=gte.{}&or=(last_polled_at.is.null,last_polled_at.lt.{})&order=last_polled_at.asc.nullsfirst,started_at.asc&limit={limit}",
            ts(started_after),
            ts(polled_before)
        ))
        .await
    }
}

#[async_trait]
impl MarketStore for PostgrestStore {
    async fn upsert_variants(&self, variants: &[CatalogVariant]) -> StoreResult<()> {
        if variants.is_empty() {
            return Ok(());
        }
        self.upsert("catalog_variants", "variant_id", variants).await
    }

    async fn latest_capture(
        &self,
        product_id: &str,
        currency: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let mut captures: Vec<CaptureRow> = self
            .select(&format!(
                "market_snapshots?product_id=eq.{}&currency=eq.{}&select=captured_at&order=captured_at.desc&limit=1",
                encode(product_id),
                encode(currency)
            ))
            .await?;
        let mut markers: Vec<RefreshRow> = self
            .select(&format!(
                "market_refreshes?product_id=eq.{}&currency=eq.{}&select=*&limit=1",
                encode(product_id),
                encode(currency)
            ))
            .await?;
        let capture = captures.pop().map(|row| row.captured_at);
        let marker = markers.pop().map(|row| row.refreshed_at);
        Ok(capture.max(marker))
    }

    async fn mark_refreshed(
        &self,
        product_id: &str,
        currency: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let row = RefreshRow {
            product_id: product_id.to_string(),
            currency: currency.to_string(),
            refreshed_at: at,
        };
        self.upsert("market_refreshes", "product_id,currency", &[row])
            .await
    }

    async fn insert_snapshots(&self, snapshots: &[MarketSnapshot]) -> StoreResult<()> {
        if snapshots.is_empty() {
            return Ok(());
        }
        self.insert("market_snapshots", snapshots, "return=minimal")
            .await
    }

    async fn latest_snapshots(
        &self,
        product_id: &str,
        currency: &str,
    ) -> StoreResult<Vec<MarketSnapshot>> {
        let rows: Vec<MarketSnapshot> = self
            .select(&format!(
                "market_snapshots?product_id=eq.{}&currency=eq.{}&select=*&order=captured_at.desc&limit={LATEST_SCAN_LIMIT}",
                encode(product_id),
                encode(currency)
            ))
            .await?;
        let mut seen = HashSet::new();
        let mut latest: Vec<MarketSnapshot> = rows
            .into_iter()
            .filter(|row| seen.insert(row.variant_id.clone()))
            .collect();
        latest.sort_by(|a, b| a.variant_id.cmp(&b.variant_id));
        Ok(latest)
    }

    async fn refresh_latest_projection(&self) -> StoreResult<()> {
        let builder = self
            .request(Method::POST, "rpc/refresh_market_latest_prices")
            .json(&json!({}));
        self.send(builder)
            .await
            .map(|_| ())
            .map_err(|err| StoreError::Projection(err.to_string()))
    }
}

#[async_trait]
impl JobStore for PostgrestStore {
    async fn enqueue_jobs(&self, jobs: &[SyncJob]) -> StoreResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let builder = self
            .request(Method::POST, "sync_jobs?on_conflict=job_id")
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(jobs);
        self.send(builder).await.map(|_| ())
    }

    async fn claim_jobs(
        &self,
        seller_id: Uuid,
        limit: usize,
        lease_expired_before: DateTime<Utc>,
    ) -> StoreResult<Vec<SyncJob>> {
        let claimable = claimable_filter(lease_expired_before);
        let candidates: Vec<SyncJob> = self
            .select(&format!(
                "sync_jobs?seller_id=eq.{seller_id}&{claimable}&select=*&order=updated_at.asc&limit={limit}"
            ))
            .await?;
        let now = Utc::now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for job in candidates {
            // Filtering on the status and `updated_at` that were read makes the patch a
            // compare-and-set; a job claimed elsewhere in the meantime comes back empty.
            let mut rows: Vec<SyncJob> = self
                .patch(
                    &format!(
                        "sync_jobs?job_id=eq.{}&status=eq.{}&updated_at=eq.{}",
                        job.job_id,
                        job.status.as_str(),
                        ts(job.updated_at)
                    ),
                    json!({"status": "processing", "updated_at": now}),
                )
                .await?;
            if let Some(row) = rows.pop() {
                claimed.push(row);
            }
        }
        Ok(claimed)
    }

    async fn save_job(&self, job: &SyncJob) -> StoreResult<()> {
        self.upsert("sync_jobs", "job_id", &[job]).await
    }

    async fn sellers_with_jobs(&self, lease_expired_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let rows: Vec<SellerRow> = self
            .select(&format!(
                "sync_jobs?{}&select=seller_id",
                claimable_filter(lease_expired_before)
            ))
            .await?;
        let mut sellers: Vec<Uuid> = rows.into_iter().map(|row| row.seller_id).collect();
        sellers.sort();
        sellers.dedup();
        Ok(sellers)
    }
}
