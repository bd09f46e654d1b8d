pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod mock;
pub mod request;
pub mod tokens;
pub mod wire;

pub use client::{LiveMarketplaceClient, MarketplaceClient};
pub use error::RequestError;
pub use mock::MockMarketplaceClient;
pub use request::{RequestClient, RetryPolicy};
pub use tokens::{TokenCache, TokenManager};
