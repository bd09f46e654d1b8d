//! Remote payloads arrive with fields under several alternate names, amounts as either
//! strings or numbers, and optional envelopes. Everything is normalized here, on receipt,
//! into strict types; a payload missing a required field fails fast with
//! `RequestError::Decode` instead of leaking loose JSON inward.

#![allow(non_snake_case)]

use crate::marketplace::error::RequestError;
use crate::models::{CatalogVariant, ListingStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use serde_with::skip_serializing_none;

fn decode<T: DeserializeOwned>(what: &str, value: Value) -> Result<T, RequestError> {
    serde_json::from_value(value).map_err(|err| RequestError::Decode(format!("{what}: {err}")))
}

fn required(what: &str, field: &str, value: Option<String>) -> Result<String, RequestError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RequestError::Decode(format!("{what} without {field}")))
}

/// Accepts `"123.50"`, `123.5` or `null`.
pub fn amount(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Some payloads nest the listing id under `result.id` rather than `listingId`.
fn listing_id_from(value: &Value) -> Option<String> {
    ["listingId", "listing_id"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .or_else(|| value.pointer("/result/id").and_then(Value::as_str))
        .or_else(|| value.pointer("/result/listingId").and_then(Value::as_str))
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

// ---- catalog ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogProduct {
    pub product_id: String,
    pub style_id: Option<String>,
    pub title: String,
    pub brand: Option<String>,
}

#[derive(Deserialize)]
struct RawSearchPage {
    #[serde(default, alias = "results", alias = "items")]
    products: Vec<RawProduct>,
}

#[derive(Deserialize)]
struct RawProduct {
    #[serde(alias = "id", alias = "product_id")]
    productId: Option<String>,
    #[serde(default, alias = "sku", alias = "style_id")]
    styleId: Option<String>,
    #[serde(default, alias = "name")]
    title: Option<String>,
    #[serde(default)]
    brand: Option<String>,
}

pub fn parse_search(value: Value) -> Result<Vec<CatalogProduct>, RequestError> {
    let page: RawSearchPage = decode("catalog search", value)?;
    page.products
        .into_iter()
        .map(|raw| {
            let product_id = required("catalog product", "productId", raw.productId)?;
            Ok(CatalogProduct {
                title: raw.title.unwrap_or_else(|| product_id.clone()),
                product_id,
                style_id: raw.styleId.filter(|s| !s.trim().is_empty()),
                brand: raw.brand,
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct RawVariant {
    #[serde(alias = "id", alias = "variant_id")]
    variantId: Option<String>,
    #[serde(default, alias = "product_id")]
    productId: Option<String>,
    #[serde(default, alias = "size", alias = "variantName")]
    variantValue: Option<String>,
    #[serde(default)]
    gtins: Vec<RawGtin>,
}

#[derive(Deserialize)]
struct RawGtin {
    identifier: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVariantList {
    Bare(Vec<RawVariant>),
    Wrapped { variants: Vec<RawVariant> },
}

pub fn parse_variants(
    product_id: &str,
    value: Value,
    now: DateTime<Utc>,
) -> Result<Vec<CatalogVariant>, RequestError> {
    let raw = match decode::<RawVariantList>("variants", value)? {
        RawVariantList::Bare(list) => list,
        RawVariantList::Wrapped { variants } => variants,
    };
    raw.into_iter()
        .map(|variant| {
            Ok(CatalogVariant {
                product_id: variant
                    .productId
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| product_id.to_string()),
                variant_id: required("variant", "variantId", variant.variantId)?,
                size: variant.variantValue.filter(|s| !s.trim().is_empty()),
                gtin: variant.gtins.into_iter().find_map(|g| g.identifier),
                updated_at: now,
            })
        })
        .collect()
}

// ---- market data ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantMarketData {
    pub variant_id: String,
    pub currency: String,
    pub lowest_ask: Option<f64>,
    pub highest_bid: Option<f64>,
}

pub fn parse_market_data(
    currency: &str,
    value: Value,
) -> Result<Vec<VariantMarketData>, RequestError> {
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("variants").or_else(|| map.remove("data")) {
            Some(Value::Array(rows)) => rows,
            _ => return Err(RequestError::Decode("market data without rows".into())),
        },
        _ => return Err(RequestError::Decode("market data is not a list".into())),
    };
    rows.into_iter()
        .map(|row| {
            let variant_id = ["variantId", "variant_id", "id"]
                .iter()
                .find_map(|key| row.get(*key).and_then(Value::as_str))
                .map(str::to_string);
            let lowest_ask = ["lowestAskAmount", "lowestAsk", "lowest_ask"]
                .iter()
                .find_map(|key| amount(row.get(*key)));
            let highest_bid = ["highestBidAmount", "highestBid", "highest_bid"]
                .iter()
                .find_map(|key| amount(row.get(*key)));
            let row_currency = row
                .get("currencyCode")
                .and_then(Value::as_str)
                .unwrap_or(currency)
                .to_uppercase();
            Ok(VariantMarketData {
                variant_id: required("market data row", "variantId", variant_id)?,
                currency: row_currency,
                lowest_ask,
                highest_bid,
            })
        })
        .collect()
}

// ---- listings ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RemoteListingStatus {
    Active,
    Inactive,
    Deleted,
    Canceled,
    Matched,
    Completed,
    Pending,
    /// A status this client does not know yet, kept verbatim (upper-cased).
    Unknown(String),
}

impl RemoteListingStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "ACTIVE" | "LIVE" => Self::Active,
            "INACTIVE" | "PAUSED" => Self::Inactive,
            "DELETED" => Self::Deleted,
            "CANCELED" | "CANCELLED" => Self::Canceled,
            "MATCHED" => Self::Matched,
            "COMPLETED" | "SOLD" => Self::Completed,
            "PENDING" | "CREATED" => Self::Pending,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Deleted => "DELETED",
            Self::Canceled => "CANCELED",
            Self::Matched => "MATCHED",
            Self::Completed => "COMPLETED",
            Self::Pending => "PENDING",
            Self::Unknown(raw) => raw,
        }
    }

    /// Local status the remote status corresponds to; `None` for unknown statuses.
    pub fn local_status(&self) -> Option<ListingStatus> {
        match self {
            Self::Active => Some(ListingStatus::Active),
            Self::Inactive => Some(ListingStatus::Paused),
            Self::Pending => Some(ListingStatus::Pending),
            Self::Deleted | Self::Canceled | Self::Matched | Self::Completed => {
                Some(ListingStatus::Unlisted)
            }
            Self::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteListing {
    pub listing_id: String,
    pub status: RemoteListingStatus,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub product_id: Option<String>,
    pub variant_id: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub listings: Vec<RemoteListing>,
    pub has_next: bool,
}

pub fn parse_listing(value: Value) -> Result<RemoteListing, RequestError> {
    let listing_id = required("listing", "listingId", listing_id_from(&value))?;
    let raw_status = ["status", "listingStatus", "state"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .ok_or_else(|| RequestError::Decode(format!("listing {listing_id} without status")))?;
    let status = RemoteListingStatus::parse(raw_status);
    Ok(RemoteListing {
        amount: amount(value.get("amount")),
        currency: value
            .get("currencyCode")
            .and_then(Value::as_str)
            .map(str::to_string),
        product_id: value
            .pointer("/product/productId")
            .or_else(|| value.get("productId"))
            .and_then(Value::as_str)
            .map(str::to_string),
        variant_id: value
            .pointer("/variant/variantId")
            .or_else(|| value.get("variantId"))
            .and_then(Value::as_str)
            .map(str::to_string),
        listing_id,
        status,
        raw: value,
    })
}

pub fn parse_listing_page(value: Value) -> Result<ListingPage, RequestError> {
    let has_next = value
        .get("hasNextPage")
        .or_else(|| value.get("has_next_page"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let rows = match value.get("listings").or_else(|| value.get("data")) {
        Some(Value::Array(rows)) => rows.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err(RequestError::Decode("listings is not a list".into())),
    };
    let listings = rows
        .into_iter()
        .map(parse_listing)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ListingPage { listings, has_next })
}

// ---- operations ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemoteOperationStatus {
    Pending,
    Completed,
    PartialSuccess,
    Failed,
}

impl RemoteOperationStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "PENDING" | "QUEUED" | "PROCESSING" | "IN_PROGRESS" => Some(Self::Pending),
            "COMPLETED" | "SUCCEEDED" | "SUCCESS" => Some(Self::Completed),
            "PARTIAL_SUCCESS" => Some(Self::PartialSuccess),
            "FAILED" | "ERROR" | "CANCELED" | "CANCELLED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::PartialSuccess)
    }
}

/// A mutation accepted by the marketplace, or one polled later.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteOperation {
    pub operation_id: String,
    pub listing_id: Option<String>,
    pub status: RemoteOperationStatus,
    pub error: Option<String>,
    pub payload: Value,
}

pub fn parse_operation(value: Value) -> Result<RemoteOperation, RequestError> {
    let operation_id = ["operationId", "operation_id", "id"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string);
    let operation_id = required("operation", "operationId", operation_id)?;
    let raw_status = ["operationStatus", "status"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or("PENDING");
    let status = RemoteOperationStatus::parse(raw_status).ok_or_else(|| {
        RequestError::Decode(format!(
            "operation {operation_id} has unknown status {raw_status}"
        ))
    })?;
    let error = value
        .get("error")
        .and_then(|e| match e {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(other.to_string())),
        });
    Ok(RemoteOperation {
        listing_id: listing_id_from(&value),
        operation_id,
        status,
        error,
        payload: value,
    })
}

// ---- orders ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteOrder {
    pub order_number: String,
    pub listing_id: Option<String>,
    pub status: String,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPage {
    pub orders: Vec<RemoteOrder>,
    pub has_next: bool,
}

pub fn parse_order_page(value: Value) -> Result<OrderPage, RequestError> {
    let has_next = value
        .get("hasNextPage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let rows = value
        .get("orders")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let orders = rows
        .into_iter()
        .map(|row| {
            let order_number = ["orderNumber", "order_number", "id"]
                .iter()
                .find_map(|key| row.get(*key).and_then(Value::as_str))
                .map(str::to_string);
            Ok(RemoteOrder {
                order_number: required("order", "orderNumber", order_number)?,
                listing_id: listing_id_from(&row),
                status: row
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN")
                    .to_string(),
                amount: amount(row.get("amount")),
                currency: row
                    .get("currencyCode")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                created_at: row
                    .get("createdAt")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            })
        })
        .collect::<Result<Vec<_>, RequestError>>()?;
    Ok(OrderPage { orders, has_next })
}

// ---- outbound ----

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateListingPayload {
    pub amount: String,
    pub variant_id: String,
    pub currency_code: String,
    pub active: Option<bool>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateListingPayload {
    pub amount: Option<String>,
    pub currency_code: Option<String>,
}

pub fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 {
        format!("{amount:.0}")
    } else {
        format!("{amount:.2}")
    }
}
