//! In-memory marketplace used in mock mode and by engine tests. Mutations return pending
//! operations exactly like the live API; they only touch the listing set once the
//! operation completes, either on demand or automatically on first poll.

use crate::marketplace::client::MarketplaceClient;
use crate::marketplace::error::RequestError;
use crate::marketplace::request::RetryPolicy;
use crate::marketplace::wire::{
    CatalogProduct, CreateListingPayload, ListingPage, OrderPage, RemoteListing,
    RemoteListingStatus, RemoteOperation, RemoteOperationStatus, RemoteOrder,
    UpdateListingPayload, VariantMarketData,
};
use crate::models::{CatalogVariant, CredentialScope, OperationKind};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    Search,
    Variants,
    MarketData,
    ListListings,
    Create,
    Update,
    Delete,
    Activate,
    Deactivate,
    GetOperation,
    ListOrders,
}

/// Cloneable stand-in for the errors the request client can surface.
#[derive(Debug, Clone, PartialEq)]
pub enum MockFailure {
    RateLimited,
    Transient,
    NotFound,
    Unauthorized,
    Timeout,
    Permanent(String),
}

impl MockFailure {
    fn into_error(self, what: &str) -> RequestError {
        match self {
            MockFailure::RateLimited => RequestError::RateLimited {
                retry_after: Some(Duration::from_secs(1)),
            },
            MockFailure::Transient => RequestError::TransientServer {
                attempts: 3,
                detail: format!("{what}: HTTP 503"),
            },
            MockFailure::NotFound => RequestError::NotFound(what.to_string()),
            MockFailure::Unauthorized => RequestError::Unauthorized(what.to_string()),
            MockFailure::Timeout => RequestError::Timeout(Duration::from_secs(30)),
            MockFailure::Permanent(body) => RequestError::PermanentClient {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                body,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct PendingMutation {
    operation: RemoteOperation,
    kind: OperationKind,
    listing_id: Option<String>,
    variant_id: Option<String>,
    amount: Option<f64>,
    currency: Option<String>,
}

#[derive(Default)]
struct MockState {
    products: Vec<CatalogProduct>,
    variants: HashMap<String, Vec<CatalogVariant>>,
    market: HashMap<(String, String), Vec<VariantMarketData>>,
    listings: BTreeMap<String, RemoteListing>,
    operations: HashMap<String, PendingMutation>,
    orders: Vec<RemoteOrder>,
    calls: HashMap<MockCall, usize>,
    call_times: Vec<(MockCall, Instant)>,
    injected: HashMap<MockCall, VecDeque<MockFailure>>,
    query_failures: HashMap<String, MockFailure>,
    next_listing: u64,
}

#[derive(Default)]
pub struct MockMarketplaceClient {
    state: Mutex<MockState>,
    auto_complete: bool,
}

impl MockMarketplaceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations complete the first time they are polled.
    pub fn auto_completing() -> Self {
        Self {
            auto_complete: true,
            ..Self::default()
        }
    }

    /// A small catalog so mock mode is usable without seeding.
    pub async fn with_demo_catalog(self) -> Self {
        for (product, style, title) in [
            ("prod-dunk-panda", "DD1391-100", "Nike Dunk Low Retro White Black"),
            ("prod-aj1-chicago", "DZ5485-612", "Jordan 1 Retro High OG Chicago Lost and Found"),
            ("prod-samba-og", "B75806", "adidas Samba OG Cloud White"),
        ] {
            let sizes = ["8", "9", "9.5", "10", "11"];
            self.add_product(product, style, title, &sizes).await;
            let rows = sizes
                .iter()
                .enumerate()
                .map(|(i, size)| VariantMarketData {
                    variant_id: format!("{product}-{size}"),
                    currency: "USD".into(),
                    lowest_ask: Some(150.0 + 10.0 * i as f64),
                    highest_bid: Some(120.0 + 8.0 * i as f64),
                })
                .collect();
            self.set_market_data(product, "USD", rows).await;
        }
        self
    }

    /// Registers a product whose variants are `{product_id}-{size}`.
    pub async fn add_product(&self, product_id: &str, style_id: &str, title: &str, sizes: &[&str]) {
        let mut state = self.state.lock().await;
        state.products.push(CatalogProduct {
            product_id: product_id.to_string(),
            style_id: Some(style_id.to_string()),
            title: title.to_string(),
            brand: None,
        });
        let now = Utc::now();
        state.variants.insert(
            product_id.to_string(),
            sizes
                .iter()
                .map(|size| CatalogVariant {
                    product_id: product_id.to_string(),
                    variant_id: format!("{product_id}-{size}"),
                    size: Some(size.to_string()),
                    gtin: None,
                    updated_at: now,
                })
                .collect(),
        );
    }

    pub async fn set_market_data(&self, product_id: &str, currency: &str, rows: Vec<VariantMarketData>) {
        self.state
            .lock()
            .await
            .market
            .insert((product_id.to_string(), currency.to_uppercase()), rows);
    }

    pub async fn add_listing(&self, listing_id: &str, status: RemoteListingStatus, amount: f64) {
        self.state.lock().await.listings.insert(
            listing_id.to_string(),
            RemoteListing {
                listing_id: listing_id.to_string(),
                amount: Some(amount),
                currency: Some("USD".into()),
                product_id: None,
                variant_id: None,
                raw: json!({"listingId": listing_id, "status": status.as_str()}),
                status,
            },
        );
    }

    pub async fn remove_listing(&self, listing_id: &str) {
        self.state.lock().await.listings.remove(listing_id);
    }

    pub async fn listing(&self, listing_id: &str) -> Option<RemoteListing> {
        self.state.lock().await.listings.get(listing_id).cloned()
    }

    pub async fn add_order(&self, order: RemoteOrder) {
        self.state.lock().await.orders.push(order);
    }

    /// Fails the next call of `call` once with `failure`.
    pub async fn inject(&self, call: MockCall, failure: MockFailure) {
        self.state
            .lock()
            .await
            .injected
            .entry(call)
            .or_default()
            .push_back(failure);
    }

    /// Every catalog search for `query` fails with `failure`.
    pub async fn fail_query(&self, query: &str, failure: MockFailure) {
        self.state
            .lock()
            .await
            .query_failures
            .insert(query.to_string(), failure);
    }

    pub async fn calls(&self, call: MockCall) -> usize {
        self.state.lock().await.calls.get(&call).copied().unwrap_or(0)
    }

    pub async fn total_calls(&self) -> usize {
        self.state.lock().await.calls.values().sum()
    }

    pub async fn call_times(&self) -> Vec<(MockCall, Instant)> {
        self.state.lock().await.call_times.clone()
    }

    /// Completes a pending operation. `listing_id` overrides the id a create receives.
    pub async fn complete_operation(&self, operation_id: &str, listing_id: Option<&str>) -> bool {
        let mut state = self.state.lock().await;
        complete(&mut state, operation_id, listing_id.map(str::to_string))
    }

    pub async fn fail_operation(&self, operation_id: &str, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(pending) = state.operations.get_mut(operation_id) else {
            return false;
        };
        pending.operation.status = RemoteOperationStatus::Failed;
        pending.operation.error = Some(reason.to_string());
        pending.operation.payload = json!({
            "operationId": operation_id,
            "operationStatus": "FAILED",
            "error": reason,
        });
        true
    }

    pub async fn forget_operation(&self, operation_id: &str) {
        self.state.lock().await.operations.remove(operation_id);
    }

    /// Counts the call and returns an injected failure, if any.
    async fn enter(&self, call: MockCall) -> Result<(), RequestError> {
        let mut state = self.state.lock().await;
        *state.calls.entry(call).or_default() += 1;
        state.call_times.push((call, Instant::now()));
        match state.injected.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(failure) => Err(failure.into_error(&format!("{call:?}"))),
            None => Ok(()),
        }
    }

    async fn accept(
        &self,
        kind: OperationKind,
        listing_id: Option<String>,
        variant_id: Option<String>,
        amount: Option<f64>,
        currency: Option<String>,
    ) -> Result<RemoteOperation, RequestError> {
        let mut state = self.state.lock().await;
        if let Some(listing_id) = &listing_id
            && !state.listings.contains_key(listing_id)
        {
            return Err(RequestError::NotFound(format!("listing {listing_id}")));
        }
        let operation_id = format!("op-{}", Uuid::new_v4().simple());
        let operation = RemoteOperation {
            operation_id: operation_id.clone(),
            listing_id: listing_id.clone(),
            status: RemoteOperationStatus::Pending,
            error: None,
            payload: json!({
                "operationId": operation_id,
                "listingId": listing_id,
                "operationType": kind.as_str().to_uppercase(),
                "operationStatus": "PENDING",
            }),
        };
        state.operations.insert(
            operation_id,
            PendingMutation {
                operation: operation.clone(),
                kind,
                listing_id,
                variant_id,
                amount,
                currency,
            },
        );
        Ok(operation)
    }
}

fn complete(state: &mut MockState, operation_id: &str, listing_id: Option<String>) -> bool {
    let Some(pending) = state.operations.get(operation_id).cloned() else {
        return false;
    };
    let listing_id = match (listing_id, pending.listing_id.clone()) {
        (Some(id), _) | (None, Some(id)) => id,
        (None, None) => {
            state.next_listing += 1;
            format!("L{}", state.next_listing)
        }
    };
    let status = match pending.kind {
        OperationKind::Create | OperationKind::Update | OperationKind::Activate => {
            RemoteListingStatus::Active
        }
        OperationKind::Delete => RemoteListingStatus::Deleted,
        OperationKind::Deactivate => RemoteListingStatus::Inactive,
    };
    let listing = state
        .listings
        .entry(listing_id.clone())
        .or_insert_with(|| RemoteListing {
            listing_id: listing_id.clone(),
            status: status.clone(),
            amount: None,
            currency: pending.currency.clone(),
            product_id: None,
            variant_id: pending.variant_id.clone(),
            raw: Value::Null,
        });
    listing.raw = json!({
        "listingId": listing_id,
        "status": status.as_str(),
        "amount": pending.amount.or(listing.amount),
    });
    listing.status = status;
    if pending.amount.is_some() {
        listing.amount = pending.amount;
    }

    let payload = json!({
        "operationId": operation_id,
        "listingId": listing_id,
        "operationStatus": "COMPLETED",
        "result": {"id": listing_id},
    });
    if let Some(entry) = state.operations.get_mut(operation_id) {
        entry.operation.status = RemoteOperationStatus::Completed;
        entry.operation.listing_id = Some(listing_id);
        entry.operation.payload = payload;
    }
    true
}

#[async_trait]
impl MarketplaceClient for MockMarketplaceClient {
    async fn search_catalog(
        &self,
        _scope: CredentialScope,
        query: &str,
        _policy: Option<&RetryPolicy>,
    ) -> Result<Vec<CatalogProduct>, RequestError> {
        self.enter(MockCall::Search).await?;
        let state = self.state.lock().await;
        if let Some(failure) = state.query_failures.get(query) {
            return Err(failure.clone().into_error(query));
        }
        let needle = query.to_lowercase();
        Ok(state
            .products
            .iter()
            .filter(|p| {
                p.style_id.as_deref().map(str::to_lowercase).as_deref() == Some(needle.as_str())
                    || p.title.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect())
    }

    async fn list_variants(
        &self,
        _scope: CredentialScope,
        product_id: &str,
        _policy: Option<&RetryPolicy>,
    ) -> Result<Vec<CatalogVariant>, RequestError> {
        self.enter(MockCall::Variants).await?;
        self.state
            .lock()
            .await
            .variants
            .get(product_id)
            .cloned()
            .ok_or_else(|| RequestError::NotFound(format!("product {product_id}")))
    }

    async fn market_data(
        &self,
        _scope: CredentialScope,
        product_id: &str,
        currency: &str,
        _policy: Option<&RetryPolicy>,
    ) -> Result<Vec<VariantMarketData>, RequestError> {
        self.enter(MockCall::MarketData).await?;
        let state = self.state.lock().await;
        if let Some(rows) = state
            .market
            .get(&(product_id.to_string(), currency.to_uppercase()))
        {
            return Ok(rows.clone());
        }
        // Variants without price data in this region.
        state
            .variants
            .get(product_id)
            .map(|variants| {
                variants
                    .iter()
                    .map(|v| VariantMarketData {
                        variant_id: v.variant_id.clone(),
                        currency: currency.to_uppercase(),
                        lowest_ask: None,
                        highest_bid: None,
                    })
                    .collect()
            })
            .ok_or_else(|| RequestError::NotFound(format!("product {product_id}")))
    }

    async fn list_listings(
        &self,
        _scope: CredentialScope,
        page_number: u32,
        page_size: u32,
    ) -> Result<ListingPage, RequestError> {
        self.enter(MockCall::ListListings).await?;
        let state = self.state.lock().await;
        let size = page_size.max(1) as usize;
        let skip = (page_number.max(1) as usize - 1) * size;
        let listings: Vec<RemoteListing> =
            state.listings.values().skip(skip).take(size).cloned().collect();
        Ok(ListingPage {
            has_next: skip + listings.len() < state.listings.len(),
            listings,
        })
    }

    async fn create_listing(
        &self,
        _scope: CredentialScope,
        payload: &CreateListingPayload,
    ) -> Result<RemoteOperation, RequestError> {
        self.enter(MockCall::Create).await?;
        self.accept(
            OperationKind::Create,
            None,
            Some(payload.variant_id.clone()),
            payload.amount.parse().ok(),
            Some(payload.currency_code.clone()),
        )
        .await
    }

    async fn update_listing(
        &self,
        _scope: CredentialScope,
        listing_id: &str,
        payload: &UpdateListingPayload,
    ) -> Result<RemoteOperation, RequestError> {
        self.enter(MockCall::Update).await?;
        self.accept(
            OperationKind::Update,
            Some(listing_id.to_string()),
            None,
            payload.amount.as_deref().and_then(|a| a.parse().ok()),
            payload.currency_code.clone(),
        )
        .await
    }

    async fn delete_listing(
        &self,
        _scope: CredentialScope,
        listing_id: &str,
    ) -> Result<RemoteOperation, RequestError> {
        self.enter(MockCall::Delete).await?;
        self.accept(OperationKind::Delete, Some(listing_id.to_string()), None, None, None)
            .await
    }

    async fn activate_listing(
        &self,
        _scope: CredentialScope,
        listing_id: &str,
    ) -> Result<RemoteOperation, RequestError> {
        self.enter(MockCall::Activate).await?;
        self.accept(OperationKind::Activate, Some(listing_id.to_string()), None, None, None)
            .await
    }

    async fn deactivate_listing(
        &self,
        _scope: CredentialScope,
        listing_id: &str,
    ) -> Result<RemoteOperation, RequestError> {
        self.enter(MockCall::Deactivate).await?;
        self.accept(OperationKind::Deactivate, Some(listing_id.to_string()), None, None, None)
            .await
    }

    async fn get_operation(
        &self,
        _scope: CredentialScope,
        _listing_id: Option<&str>,
        operation_id: &str,
    ) -> Result<RemoteOperation, RequestError> {
        self.enter(MockCall::GetOperation).await?;
        let mut state = self.state.lock().await;
        let pending = state
            .operations
            .get(operation_id)
            .map(|p| p.operation.status == RemoteOperationStatus::Pending)
            .ok_or_else(|| RequestError::NotFound(format!("operation {operation_id}")))?;
        if pending && self.auto_complete {
            complete(&mut state, operation_id, None);
        }
        state
            .operations
            .get(operation_id)
            .map(|p| p.operation.clone())
            .ok_or_else(|| RequestError::NotFound(format!("operation {operation_id}")))
    }

    async fn list_orders(
        &self,
        _scope: CredentialScope,
        page_number: u32,
        page_size: u32,
    ) -> Result<OrderPage, RequestError> {
        self.enter(MockCall::ListOrders).await?;
        let state = self.state.lock().await;
        let size = page_size.max(1) as usize;
        let skip = (page_number.max(1) as usize - 1) * size;
        let orders: Vec<RemoteOrder> = state.orders.iter().skip(skip).take(size).cloned().collect();
        Ok(OrderPage {
            has_next: skip + orders.len() < state.orders.len(),
            orders,
        })
    }
}
