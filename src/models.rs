use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Which OAuth credential a call runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "seller_id", rename_all = "snake_case")]
pub enum CredentialScope {
    Seller(Uuid),
    Application,
}

impl CredentialScope {
    pub fn seller_id(&self) -> Option<Uuid> {
        match self {
            CredentialScope::Seller(id) => Some(*id),
            CredentialScope::Application => None,
        }
    }
}

impl fmt::Display for CredentialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialScope::Seller(id) => write!(f, "seller:{id}"),
            CredentialScope::Application => f.write_str("application"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub scope: CredentialScope,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub connection_broken_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub broken_reason: Option<String>,
}

impl Credential {
    /// True when the access token expires within `skew` of `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now + skew >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Unlisted,
    Pending,
    Active,
    Paused,
    Missing,
    Invalid,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Unlisted => "unlisted",
            ListingStatus::Pending => "pending",
            ListingStatus::Active => "active",
            ListingStatus::Paused => "paused",
            ListingStatus::Missing => "missing",
            ListingStatus::Invalid => "invalid",
        }
    }

    /// Statuses a quick reconcile still bothers to look at.
    pub const LIKELY_LIVE: [ListingStatus; 3] = [
        ListingStatus::Active,
        ListingStatus::Paused,
        ListingStatus::Pending,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingMapping {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub local_item_id: Uuid,
    pub remote_product_id: String,
    pub remote_variant_id: String,
    pub remote_listing_id: Option<String>,
    pub listing_status: ListingStatus,
    pub ask_amount: Option<f64>,
    pub currency: String,
    pub remote_payload: Option<Value>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ListingMapping {
    pub fn new(
        seller_id: Uuid,
        local_item_id: Uuid,
        remote_product_id: impl Into<String>,
        remote_variant_id: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            seller_id,
            local_item_id,
            remote_product_id: remote_product_id.into(),
            remote_variant_id: remote_variant_id.into(),
            remote_listing_id: None,
            listing_status: ListingStatus::Unlisted,
            ask_amount: None,
            currency: currency.into(),
            remote_payload: None,
            last_sync_at: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// "Is this item listed" as downstream screens understand it.
    pub fn is_listed(&self) -> bool {
        self.remote_listing_id.is_some()
            && matches!(
                self.listing_status,
                ListingStatus::Active | ListingStatus::Paused | ListingStatus::Pending
            )
    }

    /// Moves the mapping to `missing` and forgets the remote listing.
    pub fn mark_missing(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        self.listing_status = ListingStatus::Missing;
        self.remote_listing_id = None;
        self.last_error = Some(reason.into());
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Activate,
    Deactivate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Activate => "activate",
            OperationKind::Deactivate => "deactivate",
        }
    }

    /// Listing status a successful operation of this kind leaves behind.
    pub fn completed_status(&self) -> ListingStatus {
        match self {
            OperationKind::Create | OperationKind::Update | OperationKind::Activate => {
                ListingStatus::Active
            }
            OperationKind::Delete => ListingStatus::Unlisted,
            OperationKind::Deactivate => ListingStatus::Paused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::TimedOut
        )
    }

    /// Monotonic transitions only: terminal states are never left.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        match self {
            OperationStatus::Queued => next != OperationStatus::Queued,
            OperationStatus::Processing => next.is_terminal() || next == OperationStatus::Processing,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::TimedOut => {
                false
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub operation_id: String,
    pub seller_id: Uuid,
    pub kind: OperationKind,
    pub related_listing_id: Option<String>,
    pub local_item_id: Uuid,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub attempts_polled: u32,
    pub previous_listing_status: ListingStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Operation {
    /// Applies `next` if the state machine allows it. Returns whether anything changed.
    pub fn transition(&mut self, next: OperationStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let changed = self.status != next;
        self.status = next;
        changed
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>, limit: Duration) -> bool {
        now - self.started_at > limit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub product_id: String,
    pub variant_id: String,
    pub currency: String,
    pub lowest_ask: Option<f64>,
    pub highest_bid: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogVariant {
    pub product_id: String,
    pub variant_id: String,
    pub size: Option<String>,
    pub gtin: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Pending,
    Processing,
    Done,
    Failed,
    Deferred,
}

impl SyncJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobStatus::Pending => "pending",
            SyncJobStatus::Processing => "processing",
            SyncJobStatus::Done => "done",
            SyncJobStatus::Failed => "failed",
            SyncJobStatus::Deferred => "deferred",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncJob {
    pub job_id: Uuid,
    pub seller_id: Uuid,
    pub sku: String,
    pub size: Option<String>,
    pub status: SyncJobStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn new(seller_id: Uuid, sku: impl Into<String>, size: Option<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            seller_id,
            sku: sku.into(),
            size,
            status: SyncJobStatus::Pending,
            retry_count: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingHistoryEntry {
    pub id: Uuid,
    pub local_item_id: Uuid,
    pub operation_id: Option<String>,
    pub kind: OperationKind,
    pub from_status: ListingStatus,
    pub to_status: ListingStatus,
    pub remote_listing_id: Option<String>,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [
            OperationStatus::Completed,
            OperationStatus::Failed,
            OperationStatus::TimedOut,
        ] {
            for next in [
                OperationStatus::Queued,
                OperationStatus::Processing,
                OperationStatus::Completed,
                OperationStatus::Failed,
                OperationStatus::TimedOut,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn processing_cannot_go_back_to_queued() {
        assert!(!OperationStatus::Processing.can_transition_to(OperationStatus::Queued));
        assert!(OperationStatus::Queued.can_transition_to(OperationStatus::Processing));
        assert!(OperationStatus::Queued.can_transition_to(OperationStatus::Failed));
    }

    #[test]
    fn credential_refresh_window_uses_skew() {
        let now = Utc::now();
        let credential = Credential {
            scope: CredentialScope::Application,
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: now + Duration::seconds(45),
            connection_broken_at: None,
            broken_reason: None,
        };
        assert!(credential.needs_refresh(now, Duration::seconds(60)));
        assert!(!credential.needs_refresh(now, Duration::seconds(30)));
    }

    #[test]
    fn completed_status_per_kind() {
        assert_eq!(OperationKind::Create.completed_status(), ListingStatus::Active);
        assert_eq!(OperationKind::Delete.completed_status(), ListingStatus::Unlisted);
        assert_eq!(OperationKind::Deactivate.completed_status(), ListingStatus::Paused);
    }

    #[test]
    fn mark_missing_clears_remote_listing() {
        let mut mapping = ListingMapping::new(Uuid::new_v4(), Uuid::new_v4(), "p", "v", "USD");
        mapping.remote_listing_id = Some("L1".into());
        mapping.listing_status = ListingStatus::Active;
        assert!(mapping.is_listed());
        mapping.mark_missing(Utc::now(), "absent");
        assert_eq!(mapping.listing_status, ListingStatus::Missing);
        assert!(mapping.remote_listing_id.is_none());
        assert!(!mapping.is_listed());
    }
}
