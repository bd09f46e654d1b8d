use crate::marketplace::error::RequestError;
use crate::marketplace::request::{RequestClient, RetryPolicy};
use crate::marketplace::wire::{
    self, CatalogProduct, CreateListingPayload, ListingPage, OrderPage, RemoteOperation,
    UpdateListingPayload, VariantMarketData,
};
use crate::models::{CatalogVariant, CredentialScope};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use urlencoding::encode;

/// What the engine needs from the marketplace. The live and mock providers both implement
/// it; `main` picks one at startup and hands the same `Arc<dyn MarketplaceClient>` to
/// every component.
///
/// Read methods accept an optional [`RetryPolicy`] override so callers with their own
/// pacing (the batch worker) can surface rate limits instead of waiting them out.
#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    async fn search_catalog(
        &self,
        scope: CredentialScope,
        query: &str,
        policy: Option<&RetryPolicy>,
    ) -> Result<Vec<CatalogProduct>, RequestError>;

    async fn list_variants(
        &self,
        scope: CredentialScope,
        product_id: &str,
        policy: Option<&RetryPolicy>,
    ) -> Result<Vec<CatalogVariant>, RequestError>;

    async fn market_data(
        &self,
        scope: CredentialScope,
        product_id: &str,
        currency: &str,
        policy: Option<&RetryPolicy>,
    ) -> Result<Vec<VariantMarketData>, RequestError>;

    async fn list_listings(
        &self,
        scope: CredentialScope,
        page_number: u32,
        page_size: u32,
    ) -> Result<ListingPage, RequestError>;

    async fn create_listing(
        &self,
        scope: CredentialScope,
        payload: &CreateListingPayload,
    ) -> Result<RemoteOperation, RequestError>;

    async fn update_listing(
        &self,
        scope: CredentialScope,
        listing_id: &str,
        payload: &UpdateListingPayload,
    ) -> Result<RemoteOperation, RequestError>;

    async fn delete_listing(
        &self,
        scope: CredentialScope,
        listing_id: &str,
    ) -> Result<RemoteOperation, RequestError>;

    async fn activate_listing(
        &self,
        scope: CredentialScope,
        listing_id: &str,
    ) -> Result<RemoteOperation, RequestError>;

    async fn deactivate_listing(
        &self,
        scope: CredentialScope,
        listing_id: &str,
    ) -> Result<RemoteOperation, RequestError>;

    /// `listing_id` is unknown for a create that has not completed yet; the operation is
    /// then looked up by id alone.
    async fn get_operation(
        &self,
        scope: CredentialScope,
        listing_id: Option<&str>,
        operation_id: &str,
    ) -> Result<RemoteOperation, RequestError>;

    async fn list_orders(
        &self,
        scope: CredentialScope,
        page_number: u32,
        page_size: u32,
    ) -> Result<OrderPage, RequestError>;
}

pub struct LiveMarketplaceClient {
    requests: Arc<RequestClient>,
}

impl LiveMarketplaceClient {
    pub fn new(requests: Arc<RequestClient>) -> Self {
        Self { requests }
    }

    async fn get(
        &self,
        scope: CredentialScope,
        endpoint: &str,
        policy: Option<&RetryPolicy>,
    ) -> Result<Value, RequestError> {
        self.requests
            .request(scope, Method::GET, endpoint, None, policy)
            .await
    }

    async fn mutate(
        &self,
        scope: CredentialScope,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<RemoteOperation, RequestError> {
        let value = self
            .requests
            .request(scope, method.clone(), endpoint, body.as_ref(), None)
            .await?;
        let operation = wire::parse_operation(value)?;
        debug!(
            target = "resale.marketplace",
            %method,
            endpoint,
            operation_id = %operation.operation_id,
            "mutation accepted"
        );
        Ok(operation)
    }
}

fn to_body<T: serde::Serialize>(payload: &T) -> Result<Value, RequestError> {
    serde_json::to_value(payload).map_err(|err| RequestError::Decode(err.to_string()))
}

fn listing_path(listing_id: &str) -> String {
    format!("/v2/selling/listings/{}", encode(listing_id))
}

#[async_trait]
impl MarketplaceClient for LiveMarketplaceClient {
    async fn search_catalog(
        &self,
        scope: CredentialScope,
        query: &str,
        policy: Option<&RetryPolicy>,
    ) -> Result<Vec<CatalogProduct>, RequestError> {
        let endpoint = format!(
            "/v2/catalog/search?query={}&pageNumber=1&pageSize=10",
            encode(query)
        );
        wire::parse_search(self.get(scope, &endpoint, policy).await?)
    }

    async fn list_variants(
        &self,
        scope: CredentialScope,
        product_id: &str,
        policy: Option<&RetryPolicy>,
    ) -> Result<Vec<CatalogVariant>, RequestError> {
        let endpoint = format!("/v2/catalog/products/{}/variants", encode(product_id));
        let value = self.get(scope, &endpoint, policy).await?;
        wire::parse_variants(product_id, value, Utc::now())
    }

    async fn market_data(
        &self,
        scope: CredentialScope,
        product_id: &str,
        currency: &str,
        policy: Option<&RetryPolicy>,
    ) -> Result<Vec<VariantMarketData>, RequestError> {
        let endpoint = format!(
            "/v2/catalog/products/{}/market-data?currencyCode={}",
            encode(product_id),
            encode(currency)
        );
        wire::parse_market_data(currency, self.get(scope, &endpoint, policy).await?)
    }

    async fn list_listings(
        &self,
        scope: CredentialScope,
        page_number: u32,
        page_size: u32,
    ) -> Result<ListingPage, RequestError> {
        let endpoint =
            format!("/v2/selling/listings?pageNumber={page_number}&pageSize={page_size}");
        wire::parse_listing_page(self.get(scope, &endpoint, None).await?)
    }

    async fn create_listing(
        &self,
        scope: CredentialScope,
        payload: &CreateListingPayload,
    ) -> Result<RemoteOperation, RequestError> {
        let body = to_body(payload)?;
        self.mutate(scope, Method::POST, "/v2/selling/listings", Some(body))
            .await
    }

    async fn update_listing(
        &self,
        scope: CredentialScope,
        listing_id: &str,
        payload: &UpdateListingPayload,
    ) -> Result<RemoteOperation, RequestError> {
        let body = to_body(payload)?;
        self.mutate(scope, Method::PATCH, &listing_path(listing_id), Some(body))
            .await
    }

    async fn delete_listing(
        &self,
        scope: CredentialScope,
        listing_id: &str,
    ) -> Result<RemoteOperation, RequestError> {
        self.mutate(scope, Method::DELETE, &listing_path(listing_id), None)
            .await
    }

    async fn activate_listing(
        &self,
        scope: CredentialScope,
        listing_id: &str,
    ) -> Result<RemoteOperation, RequestError> {
        let endpoint = format!("{}/activate", listing_path(listing_id));
        self.mutate(scope, Method::PUT, &endpoint, None).await
    }

    async fn deactivate_listing(
        &self,
        scope: CredentialScope,
        listing_id: &str,
    ) -> Result<RemoteOperation, RequestError> {
        let endpoint = format!("{}/deactivate", listing_path(listing_id));
        self.mutate(scope, Method::PUT, &endpoint, None).await
    }

    async fn get_operation(
        &self,
        scope: CredentialScope,
        listing_id: Option<&str>,
        operation_id: &str,
    ) -> Result<RemoteOperation, RequestError> {
        let endpoint = match listing_id {
            Some(listing_id) => format!(
                "{}/operations/{}",
                listing_path(listing_id),
                encode(operation_id)
            ),
            None => format!("/v2/selling/operations/{}", encode(operation_id)),
        };
        wire::parse_operation(self.get(scope, &endpoint, None).await?)
    }

    async fn list_orders(
        &self,
        scope: CredentialScope,
        page_number: u32,
        page_size: u32,
    ) -> Result<OrderPage, RequestError> {
        let endpoint = format!(
            "/v2/selling/orders/history?pageNumber={page_number}&pageSize={page_size}"
        );
        wire::parse_order_page(self.get(scope, &endpoint, None).await?)
    }
}
