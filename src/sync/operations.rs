use crate::config::SyncConfig;
use crate::marketplace::wire::{
    CreateListingPayload, RemoteOperation, RemoteOperationStatus, UpdateListingPayload,
    format_amount,
};
use crate::marketplace::{MarketplaceClient, RequestError, TokenManager};
use crate::models::{
    CredentialScope, ListingHistoryEntry, ListingMapping, ListingStatus, Operation,
    OperationKind, OperationStatus,
};
use crate::store::SyncStore;
use crate::sync::SyncError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on operations forced to `timed_out` in one sweep.
const TIMEOUT_SWEEP_LIMIT: usize = 500;

/// A listing mutation requested for one local item.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Create {
        local_item_id: Uuid,
        amount: f64,
        #[serde(default)]
        currency: Option<String>,
    },
    Update {
        local_item_id: Uuid,
        amount: f64,
        #[serde(default)]
        currency: Option<String>,
    },
    Delete {
        local_item_id: Uuid,
    },
    Activate {
        local_item_id: Uuid,
    },
    Deactivate {
        local_item_id: Uuid,
    },
}

impl Mutation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Mutation::Create { .. } => OperationKind::Create,
            Mutation::Update { .. } => OperationKind::Update,
            Mutation::Delete { .. } => OperationKind::Delete,
            Mutation::Activate { .. } => OperationKind::Activate,
            Mutation::Deactivate { .. } => OperationKind::Deactivate,
        }
    }

    pub fn local_item_id(&self) -> Uuid {
        match self {
            Mutation::Create { local_item_id, .. }
            | Mutation::Update { local_item_id, .. }
            | Mutation::Delete { local_item_id }
            | Mutation::Activate { local_item_id }
            | Mutation::Deactivate { local_item_id } => *local_item_id,
        }
    }

    fn amount(&self) -> Option<f64> {
        match self {
            Mutation::Create { amount, .. } | Mutation::Update { amount, .. } => Some(*amount),
            _ => None,
        }
    }

    fn currency(&self) -> Option<&str> {
        match self {
            Mutation::Create { currency, .. } | Mutation::Update { currency, .. } => {
                currency.as_deref()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitReceipt {
    pub operation_id: String,
    pub local_item_id: Uuid,
    pub kind: OperationKind,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    /// Terminal already; nothing was done.
    Unchanged,
    Pending,
    Completed,
    Failed,
    TimedOut,
    /// Transient poll error; retried after the poll interval.
    Deferred,
    /// The seller's credential is unusable.
    AuthBlocked,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct PollSummary {
    pub timed_out: usize,
    pub polled: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub deferred: usize,
    pub warnings: Vec<String>,
}

/// Records every asynchronous remote mutation and drives it to a terminal state.
pub struct OperationTracker {
    store: Arc<dyn SyncStore>,
    client: Arc<dyn MarketplaceClient>,
    tokens: Arc<TokenManager>,
    poll_min_interval: Duration,
    poll_batch_limit: usize,
    operation_timeout: Duration,
}

impl OperationTracker {
    pub fn new(
        store: Arc<dyn SyncStore>,
        client: Arc<dyn MarketplaceClient>,
        tokens: Arc<TokenManager>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            client,
            tokens,
            poll_min_interval: config.poll_min_interval,
            poll_batch_limit: config.poll_batch_limit,
            operation_timeout: config.operation_timeout,
        }
    }

    pub async fn get(&self, operation_id: &str) -> Result<Option<Operation>, SyncError> {
        Ok(self.store.get_operation(operation_id).await?)
    }

    pub async fn submit(
        &self,
        seller_id: Uuid,
        mutation: Mutation,
    ) -> Result<SubmitReceipt, SyncError> {
        let kind = mutation.kind();
        let local_item_id = mutation.local_item_id();
        let mut mapping = self
            .store
            .get_mapping(local_item_id)
            .await?
            .filter(|m| m.seller_id == seller_id)
            .ok_or_else(|| SyncError::NotFound(format!("listing mapping {local_item_id}")))?;
        validate(&mapping, &mutation)?;

        let scope = CredentialScope::Seller(seller_id);
        let listing_id = mapping.remote_listing_id.clone();
        let accepted = match self.send(scope, &mapping, &mutation).await {
            Ok(accepted) => accepted,
            Err(err) => return Err(self.rejected(seller_id, &mut mapping, kind, err).await),
        };

        let now = Utc::now();
        let operation = Operation {
            operation_id: accepted.operation_id.clone(),
            seller_id,
            kind,
            related_listing_id: accepted.listing_id.clone().or(listing_id),
            local_item_id,
            status: OperationStatus::Queued,
            started_at: now,
            last_polled_at: None,
            attempts_polled: 0,
            previous_listing_status: mapping.listing_status,
            result: None,
            error: None,
        };
        self.store.insert_operation(&operation).await?;

        mapping.listing_status = ListingStatus::Pending;
        if let Some(amount) = mutation.amount() {
            mapping.ask_amount = Some(amount);
        }
        if let Some(currency) = mutation.currency() {
            mapping.currency = currency.to_uppercase();
        }
        mapping.last_error = None;
        mapping.updated_at = now;
        self.store.upsert_mappings(&[mapping]).await?;

        info!(
            target = "resale.operations",
            %seller_id,
            %local_item_id,
            kind = kind.as_str(),
            operation_id = %operation.operation_id,
            "operation submitted"
        );
        Ok(SubmitReceipt {
            operation_id: operation.operation_id,
            local_item_id,
            kind,
            status: "pending".into(),
        })
    }

    async fn send(
        &self,
        scope: CredentialScope,
        mapping: &ListingMapping,
        mutation: &Mutation,
    ) -> Result<RemoteOperation, RequestError> {
        let listing_id = mapping.remote_listing_id.as_deref().unwrap_or_default();
        let currency = mutation
            .currency()
            .map(str::to_uppercase)
            .unwrap_or_else(|| mapping.currency.clone());
        match mutation {
            Mutation::Create { amount, .. } => {
                let payload = CreateListingPayload {
                    amount: format_amount(*amount),
                    variant_id: mapping.remote_variant_id.clone(),
                    currency_code: currency,
                    active: Some(true),
                };
                self.client.create_listing(scope, &payload).await
            }
            Mutation::Update { amount, .. } => {
                let payload = UpdateListingPayload {
                    amount: Some(format_amount(*amount)),
                    currency_code: Some(currency),
                };
                self.client.update_listing(scope, listing_id, &payload).await
            }
            Mutation::Delete { .. } => self.client.delete_listing(scope, listing_id).await,
            Mutation::Activate { .. } => self.client.activate_listing(scope, listing_id).await,
            Mutation::Deactivate { .. } => {
                self.client.deactivate_listing(scope, listing_id).await
            }
        }
    }

    /// Turns a submission error into the matching mapping transition where one applies.
    async fn rejected(
        &self,
        seller_id: Uuid,
        mapping: &mut ListingMapping,
        kind: OperationKind,
        err: RequestError,
    ) -> SyncError {
        let now = Utc::now();
        if err.is_not_found() {
            match kind {
                OperationKind::Create => {
                    mapping.listing_status = ListingStatus::Invalid;
                    mapping.last_error = Some(format!("catalog rejected variant: {err}"));
                    mapping.updated_at = now;
                }
                _ => mapping.mark_missing(now, format!("remote listing not found: {err}")),
            }
            warn!(
                target = "resale.operations",
                %seller_id,
                local_item_id = %mapping.local_item_id,
                kind = kind.as_str(),
                status = mapping.listing_status.as_str(),
                "submission hit a missing remote resource"
            );
            if let Err(store_err) = self.store.upsert_mappings(&[mapping.clone()]).await {
                return store_err.into();
            }
        } else if err.is_unauthorized() {
            self.tokens.mark_broken(seller_id, &err.to_string()).await;
        }
        err.into()
    }

    /// One scheduler tick: time out stale operations, then poll the ones that are due.
    pub async fn poll_cycle(&self, now: DateTime<Utc>) -> Result<PollSummary, SyncError> {
        let mut summary = PollSummary::default();

        let stale = self
            .store
            .stale_operations(now - self.operation_timeout, TIMEOUT_SWEEP_LIMIT)
            .await?;
        for operation in stale {
            let operation_id = operation.operation_id.clone();
            match self.time_out(operation, now).await {
                Ok(true) => summary.timed_out += 1,
                Ok(false) => {}
                Err(err) => summary
                    .warnings
                    .push(format!("timing out {operation_id}: {err}")),
            }
        }

        let due = self
            .store
            .due_operations(
                now - self.poll_min_interval,
                now - self.operation_timeout,
                self.poll_batch_limit,
            )
            .await?;
        for operation in due {
            let operation_id = operation.operation_id.clone();
            summary.polled += 1;
            match self.poll_operation(operation, now).await {
                Ok(PollOutcome::Completed) => summary.completed += 1,
                Ok(PollOutcome::Failed) => summary.failed += 1,
                Ok(PollOutcome::TimedOut) => summary.timed_out += 1,
                Ok(PollOutcome::Pending) => summary.pending += 1,
                Ok(PollOutcome::Deferred | PollOutcome::AuthBlocked) => summary.deferred += 1,
                Ok(PollOutcome::Unchanged) => {}
                Err(err) => summary
                    .warnings
                    .push(format!("polling {operation_id}: {err}")),
            }
        }

        if summary.polled > 0 || summary.timed_out > 0 {
            info!(
                target = "resale.operations",
                polled = summary.polled,
                completed = summary.completed,
                failed = summary.failed,
                timed_out = summary.timed_out,
                deferred = summary.deferred,
                "poll cycle finished"
            );
        }
        Ok(summary)
    }

    pub async fn poll_operation(
        &self,
        mut operation: Operation,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome, SyncError> {
        if operation.status.is_terminal() {
            return Ok(PollOutcome::Unchanged);
        }
        if operation.is_timed_out(now, self.operation_timeout) {
            return Ok(settled(
                self.time_out(operation, now).await?,
                PollOutcome::TimedOut,
            ));
        }

        let scope = CredentialScope::Seller(operation.seller_id);
        let polled = self
            .client
            .get_operation(
                scope,
                operation.related_listing_id.as_deref(),
                &operation.operation_id,
            )
            .await;
        operation.last_polled_at = Some(now);

        let remote = match polled {
            Ok(remote) => remote,
            Err(err) if err.is_not_found() => {
                let written = self
                    .finish_failed(operation, "operation not found".into(), now)
                    .await?;
                return Ok(settled(written, PollOutcome::Failed));
            }
            Err(err) => return self.poll_error(operation, err).await,
        };
        operation.attempts_polled += 1;

        let status = remote.status;
        match status {
            _ if status.is_success() => self.finish_completed(operation, remote, now).await,
            RemoteOperationStatus::Failed => {
                let reason = remote
                    .error
                    .clone()
                    .unwrap_or_else(|| "remote operation failed".into());
                operation.result = Some(remote.payload);
                let written = self.finish_failed(operation, reason, now).await?;
                Ok(settled(written, PollOutcome::Failed))
            }
            _ => {
                operation.transition(OperationStatus::Processing);
                if operation.related_listing_id.is_none() {
                    operation.related_listing_id = remote.listing_id;
                }
                if !self.store.update_operation(&operation).await? {
                    return Ok(PollOutcome::Unchanged);
                }
                debug!(
                    target = "resale.operations",
                    operation_id = %operation.operation_id,
                    attempts = operation.attempts_polled,
                    "operation still pending"
                );
                Ok(PollOutcome::Pending)
            }
        }
    }

    /// Poll call errors never count against the operation; only the poll time moves.
    async fn poll_error(
        &self,
        operation: Operation,
        err: RequestError,
    ) -> Result<PollOutcome, SyncError> {
        let auth_problem = matches!(err, RequestError::Auth(_)) || err.is_unauthorized();
        if err.is_unauthorized() {
            self.tokens
                .mark_broken(operation.seller_id, &err.to_string())
                .await;
        }
        warn!(
            target = "resale.operations",
            operation_id = %operation.operation_id,
            seller_id = %operation.seller_id,
            error = %err,
            "operation poll failed"
        );
        if !self.store.update_operation(&operation).await? {
            return Ok(PollOutcome::Unchanged);
        }
        Ok(if auth_problem {
            PollOutcome::AuthBlocked
        } else {
            PollOutcome::Deferred
        })
    }

    async fn finish_completed(
        &self,
        mut operation: Operation,
        remote: RemoteOperation,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome, SyncError> {
        let listing_id = remote
            .listing_id
            .clone()
            .or_else(|| operation.related_listing_id.clone());
        let to_status = operation.kind.completed_status();
        if to_status != ListingStatus::Unlisted && listing_id.is_none() {
            operation.result = Some(remote.payload);
            let written = self
                .finish_failed(operation, "completed without a listing id".into(), now)
                .await?;
            return Ok(settled(written, PollOutcome::Failed));
        }

        operation.related_listing_id = listing_id.clone();
        operation.result = Some(remote.payload.clone());
        operation.transition(OperationStatus::Completed);
        if !self.settle(&operation).await? {
            return Ok(PollOutcome::Unchanged);
        }

        if let Some(mut mapping) = self.store.get_mapping(operation.local_item_id).await? {
            mapping.listing_status = to_status;
            mapping.remote_listing_id = match to_status {
                ListingStatus::Unlisted => None,
                _ => listing_id.clone(),
            };
            mapping.remote_payload = Some(remote.payload);
            mapping.last_error = None;
            mapping.last_sync_at = Some(now);
            mapping.updated_at = now;
            self.store.upsert_mappings(&[mapping]).await?;
        } else {
            warn!(
                target = "resale.operations",
                operation_id = %operation.operation_id,
                local_item_id = %operation.local_item_id,
                "completed operation has no local mapping"
            );
        }

        self.record(&operation, to_status, listing_id, None, now).await;
        info!(
            target = "resale.operations",
            operation_id = %operation.operation_id,
            kind = operation.kind.as_str(),
            status = to_status.as_str(),
            "operation completed"
        );
        Ok(PollOutcome::Completed)
    }

    /// Returns false when another poller settled the operation first; nothing else is
    /// touched in that case.
    async fn finish_failed(
        &self,
        mut operation: Operation,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        operation.error = Some(reason.clone());
        operation.transition(OperationStatus::Failed);
        if !self.settle(&operation).await? {
            return Ok(false);
        }
        let restored = self.restore(&operation, &reason, now).await?;
        self.record(
            &operation,
            restored,
            operation.related_listing_id.clone(),
            Some(reason),
            now,
        )
        .await;
        warn!(
            target = "resale.operations",
            operation_id = %operation.operation_id,
            kind = operation.kind.as_str(),
            error = operation.error.as_deref().unwrap_or_default(),
            "operation failed"
        );
        Ok(true)
    }

    async fn time_out(&self, mut operation: Operation, now: DateTime<Utc>) -> Result<bool, SyncError> {
        let minutes = self.operation_timeout.num_minutes();
        let reason = format!("operation timed out after {minutes} minutes");
        operation.error = Some(reason.clone());
        operation.transition(OperationStatus::TimedOut);
        if !self.settle(&operation).await? {
            return Ok(false);
        }
        let restored = self.restore(&operation, &reason, now).await?;
        self.record(
            &operation,
            restored,
            operation.related_listing_id.clone(),
            Some(reason),
            now,
        )
        .await;
        warn!(
            target = "resale.operations",
            operation_id = %operation.operation_id,
            started_at = %operation.started_at,
            "operation timed out"
        );
        Ok(true)
    }

    /// Writes a terminal operation row. The store refuses it once the row is terminal,
    /// which keeps the mapping and history side effects to exactly one poller.
    async fn settle(&self, operation: &Operation) -> Result<bool, SyncError> {
        let written = self.store.update_operation(operation).await?;
        if !written {
            debug!(
                target = "resale.operations",
                operation_id = %operation.operation_id,
                "operation already settled by another poller"
            );
        }
        Ok(written)
    }

    /// Puts a still-pending mapping back to where it was before the operation.
    async fn restore(
        &self,
        operation: &Operation,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ListingStatus, SyncError> {
        let Some(mut mapping) = self.store.get_mapping(operation.local_item_id).await? else {
            return Ok(operation.previous_listing_status);
        };
        if mapping.listing_status == ListingStatus::Pending {
            mapping.listing_status = operation.previous_listing_status;
        }
        mapping.last_error = Some(reason.to_string());
        mapping.updated_at = now;
        let status = mapping.listing_status;
        self.store.upsert_mappings(&[mapping]).await?;
        Ok(status)
    }

    async fn record(
        &self,
        operation: &Operation,
        to_status: ListingStatus,
        remote_listing_id: Option<String>,
        note: Option<String>,
        now: DateTime<Utc>,
    ) {
        let entry = ListingHistoryEntry {
            id: Uuid::new_v4(),
            local_item_id: operation.local_item_id,
            operation_id: Some(operation.operation_id.clone()),
            kind: operation.kind,
            from_status: operation.previous_listing_status,
            to_status,
            remote_listing_id,
            note,
            recorded_at: now,
        };
        if let Err(err) = self.store.append_history(&entry).await {
            warn!(
                target = "resale.operations",
                operation_id = %operation.operation_id,
                error = %err,
                "listing history append failed"
            );
        }
    }
}

fn settled(written: bool, outcome: PollOutcome) -> PollOutcome {
    if written {
        outcome
    } else {
        PollOutcome::Unchanged
    }
}

fn validate(mapping: &ListingMapping, mutation: &Mutation) -> Result<(), SyncError> {
    if mapping.listing_status == ListingStatus::Pending {
        return Err(SyncError::InvalidInput(
            "an operation is already in flight for this item".into(),
        ));
    }
    if let Some(amount) = mutation.amount()
        && !(amount.is_finite() && amount > 0.0)
    {
        return Err(SyncError::InvalidInput(format!("invalid amount {amount}")));
    }
    match mutation {
        Mutation::Create { .. } if mapping.is_listed() => Err(SyncError::InvalidInput(
            "item already has a live listing".into(),
        )),
        Mutation::Create { .. } => Ok(()),
        _ if mapping.remote_listing_id.is_none() => Err(SyncError::InvalidInput(format!(
            "{} requires a remote listing",
            mutation.kind().as_str()
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketplace::mock::{MockCall, MockFailure};
    use crate::store::{CredentialStore, OperationStore};
    use crate::sync::testkit::Harness;

    fn tracker(h: &Harness) -> OperationTracker {
        OperationTracker::new(h.store.clone(), h.mock.clone(), h.tokens.clone(), &h.config)
    }

    fn operation(h: &Harness, local_item_id: Uuid, started_at: DateTime<Utc>) -> Operation {
        Operation {
            operation_id: format!("op-{}", Uuid::new_v4()),
            seller_id: h.seller,
            kind: OperationKind::Deactivate,
            related_listing_id: Some("L1".into()),
            local_item_id,
            status: OperationStatus::Queued,
            started_at,
            last_polled_at: None,
            attempts_polled: 0,
            previous_listing_status: ListingStatus::Active,
            result: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn create_goes_pending_then_active_with_listing_id() {
        let h = Harness::new().await;
        let mapping = h.mapping(None, ListingStatus::Unlisted).await;
        let tracker = tracker(&h);

        let receipt = tracker
            .submit(
                h.seller,
                Mutation::Create {
                    local_item_id: mapping.local_item_id,
                    amount: 150.0,
                    currency: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.status, "pending");
        let pending = h.reload(&mapping).await;
        assert_eq!(pending.listing_status, ListingStatus::Pending);
        assert_eq!(pending.ask_amount, Some(150.0));

        assert!(h.mock.complete_operation(&receipt.operation_id, Some("L9")).await);
        let summary = tracker.poll_cycle(Utc::now()).await.unwrap();
        assert_eq!(summary.completed, 1);

        let active = h.reload(&mapping).await;
        assert_eq!(active.listing_status, ListingStatus::Active);
        assert_eq!(active.remote_listing_id.as_deref(), Some("L9"));
        let stored = h.store.get_operation(&receipt.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Completed);
        let history = h.store.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_status, ListingStatus::Unlisted);
        assert_eq!(history[0].to_status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn pending_remote_moves_to_processing_and_respects_poll_spacing() {
        let h = Harness::new().await;
        h.mock
            .add_listing("L1", crate::marketplace::wire::RemoteListingStatus::Active, 100.0)
            .await;
        let mapping = h.mapping(Some("L1"), ListingStatus::Active).await;
        let tracker = tracker(&h);
        let receipt = tracker
            .submit(h.seller, Mutation::Deactivate { local_item_id: mapping.local_item_id })
            .await
            .unwrap();

        let now = Utc::now();
        let first = tracker.poll_cycle(now).await.unwrap();
        assert_eq!(first.pending, 1);
        let op = h.store.get_operation(&receipt.operation_id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Processing);
        assert_eq!(op.attempts_polled, 1);

        let too_soon = tracker.poll_cycle(now + Duration::seconds(5)).await.unwrap();
        assert_eq!(too_soon.polled, 0);
        let later = tracker.poll_cycle(now + Duration::seconds(21)).await.unwrap();
        assert_eq!(later.polled, 1);
        assert_eq!(h.mock.calls(MockCall::GetOperation).await, 2);
    }

    #[tokio::test]
    async fn terminal_operations_are_left_alone() {
        let h = Harness::new().await;
        let tracker = tracker(&h);
        let mut op = operation(&h, Uuid::new_v4(), Utc::now());
        op.status = OperationStatus::Completed;
        h.store.insert_operation(&op).await.unwrap();

        let outcome = tracker.poll_operation(op.clone(), Utc::now()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Unchanged);
        assert_eq!(h.mock.calls(MockCall::GetOperation).await, 0);
        assert_eq!(h.store.get_operation(&op.operation_id).await.unwrap(), Some(op));
    }

    #[tokio::test]
    async fn stale_operation_times_out_and_is_never_polled_again() {
        let h = Harness::new().await;
        let tracker = tracker(&h);
        let mapping = h.mapping(Some("L1"), ListingStatus::Pending).await;
        let now = Utc::now();
        let op = operation(&h, mapping.local_item_id, now - Duration::minutes(16));
        h.store.insert_operation(&op).await.unwrap();

        let summary = tracker.poll_cycle(now).await.unwrap();
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.polled, 0);
        let stored = h.store.get_operation(&op.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::TimedOut);
        let restored = h.reload(&mapping).await;
        assert_eq!(restored.listing_status, ListingStatus::Active);
        assert!(restored.last_error.unwrap().contains("timed out"));

        let again = tracker.poll_cycle(now + Duration::minutes(1)).await.unwrap();
        assert_eq!(again, PollSummary::default());
        assert_eq!(h.mock.calls(MockCall::GetOperation).await, 0);
    }

    #[tokio::test]
    async fn remote_failure_restores_previous_status() {
        let h = Harness::new().await;
        h.mock
            .add_listing("L1", crate::marketplace::wire::RemoteListingStatus::Active, 100.0)
            .await;
        let mapping = h.mapping(Some("L1"), ListingStatus::Active).await;
        let tracker = tracker(&h);
        let receipt = tracker
            .submit(
                h.seller,
                Mutation::Update {
                    local_item_id: mapping.local_item_id,
                    amount: 20.0,
                    currency: None,
                },
            )
            .await
            .unwrap();
        h.mock
            .fail_operation(&receipt.operation_id, "amount below minimum")
            .await;

        let summary = tracker.poll_cycle(Utc::now()).await.unwrap();
        assert_eq!(summary.failed, 1);
        let restored = h.reload(&mapping).await;
        assert_eq!(restored.listing_status, ListingStatus::Active);
        assert_eq!(restored.remote_listing_id.as_deref(), Some("L1"));
        assert_eq!(restored.last_error.as_deref(), Some("amount below minimum"));
    }

    #[tokio::test]
    async fn transient_poll_error_only_moves_poll_time() {
        let h = Harness::new().await;
        let tracker = tracker(&h);
        let op = operation(&h, Uuid::new_v4(), Utc::now());
        h.store.insert_operation(&op).await.unwrap();
        h.mock.inject(MockCall::GetOperation, MockFailure::Transient).await;

        let now = Utc::now();
        let outcome = tracker.poll_operation(op.clone(), now).await.unwrap();
        assert_eq!(outcome, PollOutcome::Deferred);
        let stored = h.store.get_operation(&op.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Queued);
        assert_eq!(stored.attempts_polled, 0);
        assert_eq!(stored.last_polled_at, Some(now));
    }

    #[tokio::test]
    async fn unauthorized_poll_marks_connection_broken() {
        let h = Harness::new().await;
        let tracker = tracker(&h);
        let op = operation(&h, Uuid::new_v4(), Utc::now());
        h.store.insert_operation(&op).await.unwrap();
        h.mock.inject(MockCall::GetOperation, MockFailure::Unauthorized).await;

        let outcome = tracker.poll_operation(op.clone(), Utc::now()).await.unwrap();
        assert_eq!(outcome, PollOutcome::AuthBlocked);
        let credential = h
            .store
            .load_credential(CredentialScope::Seller(h.seller))
            .await
            .unwrap()
            .unwrap();
        assert!(credential.connection_broken_at.is_some());
        let stored = h.store.get_operation(&op.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Queued);
    }

    #[tokio::test]
    async fn overlapping_polls_settle_an_operation_once() {
        let h = Harness::new().await;
        h.mock
            .add_listing("L1", crate::marketplace::wire::RemoteListingStatus::Active, 100.0)
            .await;
        let mapping = h.mapping(Some("L1"), ListingStatus::Active).await;
        let tracker = tracker(&h);
        let receipt = tracker
            .submit(h.seller, Mutation::Deactivate { local_item_id: mapping.local_item_id })
            .await
            .unwrap();
        // Two cycles loaded the same queued row before either of them polled it.
        let stored = h.store.get_operation(&receipt.operation_id).await.unwrap().unwrap();
        let (first, second, third) = (stored.clone(), stored.clone(), stored);
        assert!(h.mock.complete_operation(&receipt.operation_id, None).await);

        let now = Utc::now();
        assert_eq!(
            tracker.poll_operation(first, now).await.unwrap(),
            PollOutcome::Completed
        );
        assert_eq!(
            tracker.poll_operation(second, now).await.unwrap(),
            PollOutcome::Unchanged
        );
        h.mock.inject(MockCall::GetOperation, MockFailure::Transient).await;
        assert_eq!(
            tracker.poll_operation(third, now).await.unwrap(),
            PollOutcome::Unchanged
        );

        let stored = h.store.get_operation(&receipt.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Completed);
        assert_eq!(h.store.history().await.len(), 1);
        assert_eq!(h.reload(&mapping).await.listing_status, ListingStatus::Paused);
        let again = tracker.poll_cycle(now + Duration::minutes(1)).await.unwrap();
        assert_eq!(again.polled, 0);
    }

    #[tokio::test]
    async fn unauthorized_submit_marks_connection_broken() {
        let h = Harness::new().await;
        h.mock
            .add_listing("L1", crate::marketplace::wire::RemoteListingStatus::Active, 100.0)
            .await;
        let mapping = h.mapping(Some("L1"), ListingStatus::Active).await;
        h.mock.inject(MockCall::Deactivate, MockFailure::Unauthorized).await;

        let err = tracker(&h)
            .submit(h.seller, Mutation::Deactivate { local_item_id: mapping.local_item_id })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Request(RequestError::Unauthorized(_))));
        let credential = h
            .store
            .load_credential(CredentialScope::Seller(h.seller))
            .await
            .unwrap()
            .unwrap();
        assert!(credential.connection_broken_at.is_some());
        let untouched = h.reload(&mapping).await;
        assert_eq!(untouched.listing_status, ListingStatus::Active);
        assert!(h.store.history().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_remote_operation_fails() {
        let h = Harness::new().await;
        let tracker = tracker(&h);
        let op = operation(&h, Uuid::new_v4(), Utc::now());
        h.store.insert_operation(&op).await.unwrap();

        let outcome = tracker.poll_operation(op.clone(), Utc::now()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Failed);
        let stored = h.store.get_operation(&op.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("operation not found"));
    }

    #[tokio::test]
    async fn poll_cycle_caps_batch_size() {
        let h = Harness::new().await;
        let tracker = tracker(&h);
        let now = Utc::now();
        for _ in 0..60 {
            let op = operation(&h, Uuid::new_v4(), now - Duration::minutes(1));
            h.store.insert_operation(&op).await.unwrap();
        }
        let summary = tracker.poll_cycle(now).await.unwrap();
        assert_eq!(summary.polled, 50);
        assert_eq!(h.mock.calls(MockCall::GetOperation).await, 50);
    }

    #[tokio::test]
    async fn submit_against_vanished_listing_marks_missing() {
        let h = Harness::new().await;
        let mapping = h.mapping(Some("gone"), ListingStatus::Active).await;
        let tracker = tracker(&h);

        let err = tracker
            .submit(h.seller, Mutation::Deactivate { local_item_id: mapping.local_item_id })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Request(RequestError::NotFound(_))));
        let missing = h.reload(&mapping).await;
        assert_eq!(missing.listing_status, ListingStatus::Missing);
        assert_eq!(missing.remote_listing_id, None);
    }

    #[tokio::test]
    async fn create_rejected_by_catalog_marks_invalid() {
        let h = Harness::new().await;
        let mapping = h.mapping(None, ListingStatus::Unlisted).await;
        h.mock.inject(MockCall::Create, MockFailure::NotFound).await;
        let tracker = tracker(&h);

        tracker
            .submit(
                h.seller,
                Mutation::Create {
                    local_item_id: mapping.local_item_id,
                    amount: 150.0,
                    currency: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(h.reload(&mapping).await.listing_status, ListingStatus::Invalid);
    }

    #[tokio::test]
    async fn submit_validates_mapping_state() {
        let h = Harness::new().await;
        let tracker = tracker(&h);
        let live = h.mapping(Some("L1"), ListingStatus::Active).await;
        let unlisted = h.mapping(None, ListingStatus::Unlisted).await;

        let dup = tracker
            .submit(
                h.seller,
                Mutation::Create { local_item_id: live.local_item_id, amount: 10.0, currency: None },
            )
            .await
            .unwrap_err();
        assert!(matches!(dup, SyncError::InvalidInput(_)));

        let no_listing = tracker
            .submit(h.seller, Mutation::Delete { local_item_id: unlisted.local_item_id })
            .await
            .unwrap_err();
        assert!(matches!(no_listing, SyncError::InvalidInput(_)));

        let other_seller = tracker
            .submit(Uuid::new_v4(), Mutation::Delete { local_item_id: live.local_item_id })
            .await
            .unwrap_err();
        assert!(matches!(other_seller, SyncError::NotFound(_)));
        assert_eq!(h.mock.total_calls().await, 0);
    }
}
