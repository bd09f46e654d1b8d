use crate::config::SyncConfig;
use crate::marketplace::MarketplaceClient;
use crate::marketplace::wire::RemoteListing;
use crate::models::{CredentialScope, ListingMapping, ListingStatus};
use crate::store::SyncStore;
use crate::sync::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Only mappings that are probably live remotely.
    #[default]
    Quick,
    /// Every mapping that still references a remote listing.
    Full,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct ReconcileSummary {
    pub total_remote: usize,
    pub total_local: usize,
    pub updated_statuses: usize,
    pub marked_missing: usize,
    pub unchanged: usize,
    pub warnings: Vec<String>,
}

pub struct ListingsReconciler {
    store: Arc<dyn SyncStore>,
    client: Arc<dyn MarketplaceClient>,
    page_size: u32,
    max_pages: u32,
    upsert_chunk: usize,
}

impl ListingsReconciler {
    pub fn new(
        store: Arc<dyn SyncStore>,
        client: Arc<dyn MarketplaceClient>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            client,
            page_size: config.reconcile_page_size.max(1),
            max_pages: config.reconcile_max_pages.max(1),
            upsert_chunk: config.reconcile_upsert_chunk.max(1),
        }
    }

    pub async fn reconcile(
        &self,
        seller_id: Uuid,
        mode: ReconcileMode,
    ) -> Result<ReconcileSummary, SyncError> {
        let started = Instant::now();
        let mut summary = ReconcileSummary::default();
        let (remote, complete) = self.fetch_remote(seller_id).await?;
        if !complete {
            summary.warnings.push(format!(
                "remote listings truncated at {} pages; absent listings were not marked missing",
                self.max_pages
            ));
        }
        summary.total_remote = remote.len();

        let statuses = match mode {
            ReconcileMode::Quick => Some(&ListingStatus::LIKELY_LIVE[..]),
            ReconcileMode::Full => None,
        };
        let local = self
            .store
            .mappings_with_remote_listing(seller_id, statuses)
            .await?;
        summary.total_local = local.len();

        let now = Utc::now();
        let plan = plan(local, &remote, complete, now, &mut summary);
        self.apply(seller_id, plan, now, &mut summary).await;

        crate::metrics::stage_elapsed("reconcile", started.elapsed().as_millis());
        info!(
            target = "resale.reconcile",
            %seller_id,
            ?mode,
            total_remote = summary.total_remote,
            total_local = summary.total_local,
            updated = summary.updated_statuses,
            missing = summary.marked_missing,
            warnings = summary.warnings.len(),
            "reconcile finished"
        );
        Ok(summary)
    }

    /// Unchanged rows only get `last_sync_at`; changed rows are written only if nobody
    /// touched them since they were read, so a concurrent submit or completion wins.
    async fn apply(
        &self,
        seller_id: Uuid,
        plan: Plan,
        now: DateTime<Utc>,
        summary: &mut ReconcileSummary,
    ) {
        for (index, chunk) in plan.touched.chunks(self.upsert_chunk).enumerate() {
            if let Err(err) = self.store.touch_mappings(chunk, now).await {
                warn!(
                    target = "resale.reconcile",
                    %seller_id,
                    chunk = index,
                    rows = chunk.len(),
                    error = %err,
                    "sync time update failed"
                );
                summary
                    .warnings
                    .push(format!("sync time of chunk {index} ({} rows) not saved: {err}", chunk.len()));
            }
        }

        for change in plan.changes {
            let local_item_id = change.mapping.local_item_id;
            match self.store.update_mapping_if(&change.mapping, change.read_at).await {
                Ok(true) if change.missing => summary.marked_missing += 1,
                Ok(true) => summary.updated_statuses += 1,
                Ok(false) => {
                    debug!(target = "resale.reconcile", %seller_id, %local_item_id, "mapping changed during reconcile");
                    summary.warnings.push(format!(
                        "mapping {local_item_id} changed while reconciling; left for the next run"
                    ));
                }
                Err(err) => {
                    warn!(
                        target = "resale.reconcile",
                        %seller_id,
                        %local_item_id,
                        error = %err,
                        "mapping update failed"
                    );
                    summary
                        .warnings
                        .push(format!("mapping {local_item_id} not saved: {err}"));
                }
            }
        }
    }

    /// Returns the remote listings by id and whether every page was read.
    async fn fetch_remote(
        &self,
        seller_id: Uuid,
    ) -> Result<(HashMap<String, RemoteListing>, bool), SyncError> {
        let scope = CredentialScope::Seller(seller_id);
        let mut index = HashMap::new();
        for page_number in 1..=self.max_pages {
            let page = self
                .client
                .list_listings(scope, page_number, self.page_size)
                .await?;
            for listing in page.listings {
                index.insert(listing.listing_id.clone(), listing);
            }
            if !page.has_next {
                return Ok((index, true));
            }
        }
        warn!(
            target = "resale.reconcile",
            %seller_id,
            max_pages = self.max_pages,
            "listing page ceiling reached"
        );
        Ok((index, false))
    }
}

#[derive(Debug, Default)]
struct Plan {
    touched: Vec<Uuid>,
    changes: Vec<Change>,
}

#[derive(Debug)]
struct Change {
    mapping: ListingMapping,
    /// `updated_at` as read; the write only lands if the row still carries it.
    read_at: DateTime<Utc>,
    missing: bool,
}

fn plan(
    local: Vec<ListingMapping>,
    remote: &HashMap<String, RemoteListing>,
    complete: bool,
    now: DateTime<Utc>,
    summary: &mut ReconcileSummary,
) -> Plan {
    let mut plan = Plan::default();
    for mut mapping in local {
        let read_at = mapping.updated_at;

        // Pending mappings belong to an in-flight operation.
        if mapping.listing_status == ListingStatus::Pending {
            summary.unchanged += 1;
            plan.touched.push(mapping.local_item_id);
            continue;
        }

        let found = mapping
            .remote_listing_id
            .as_ref()
            .and_then(|id| remote.get(id));
        let missing = match found {
            None if complete => {
                mapping.mark_missing(now, "listing no longer exists on the marketplace");
                true
            }
            None => {
                summary.unchanged += 1;
                plan.touched.push(mapping.local_item_id);
                continue;
            }
            Some(listing) => match listing.status.local_status() {
                None => {
                    summary.warnings.push(format!(
                        "listing {} has unrecognised status {}; mapping left unchanged",
                        listing.listing_id,
                        listing.status.as_str()
                    ));
                    summary.unchanged += 1;
                    plan.touched.push(mapping.local_item_id);
                    continue;
                }
                Some(ListingStatus::Pending) => {
                    summary.unchanged += 1;
                    plan.touched.push(mapping.local_item_id);
                    continue;
                }
                Some(status) if status == mapping.listing_status => {
                    summary.unchanged += 1;
                    plan.touched.push(mapping.local_item_id);
                    continue;
                }
                Some(status) => {
                    mapping.listing_status = status;
                    mapping.remote_payload = Some(listing.raw.clone());
                    mapping.last_error = None;
                    mapping.updated_at = now;
                    false
                }
            },
        };
        mapping.last_sync_at = Some(now);
        plan.changes.push(Change {
            mapping,
            read_at,
            missing,
        });
    }
    plan
}
