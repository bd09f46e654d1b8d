use crate::sync::SubmitReceipt;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// How long a key stays reserved while its submission is running. A process that dies
/// mid-submit frees the key after this long.
const RESERVATION_TTL_SECS: u64 = 120;

const RESERVED: &str = "reserved";

/// What a caller presenting an `Idempotency-Key` should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The key is now held by this caller; submit, then `complete` or `release`.
    Acquired,
    /// A submission with this key already finished.
    Replay(SubmitReceipt),
    /// Another request with this key is still submitting.
    InFlight,
}

#[derive(Clone)]
enum Slot {
    Reserved,
    Done(SubmitReceipt),
}

#[derive(Clone)]
struct LocalEntry {
    slot: Slot,
    expires_at: Instant,
}

/// Remembers the receipt handed out for an `Idempotency-Key`, so a replayed submission
/// returns the first operation instead of issuing a second remote mutation.
///
/// The key is reserved before the remote call, so two concurrent requests with one key
/// cannot both submit.
#[derive(Clone)]
pub struct ReceiptCache {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, LocalEntry>>>,
    ttl_secs: u64,
}

impl ReceiptCache {
    pub fn new(redis: Option<redis::Client>, ttl_secs: u64) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl_secs,
        }
    }

    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok());
        let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3600);
        Self::new(redis, ttl)
    }

    /// Keys are scoped per seller so two sellers can reuse the same header value.
    fn scoped(seller_id: Uuid, key: &str) -> String {
        format!("resale:submit:{seller_id}:{key}")
    }

    fn reservation_ttl(&self) -> u64 {
        RESERVATION_TTL_SECS.min(self.ttl_secs)
    }

    pub async fn reserve(&self, seller_id: Uuid, key: &str) -> Reservation {
        let key = Self::scoped(seller_id, key);
        if let Some(client) = &self.redis {
            return redis_reserve(client, &key, self.reservation_ttl()).await;
        }

        let now = Instant::now();
        let mut local = self.local.lock().await;
        local.retain(|_, entry| entry.expires_at > now);
        match local.get(&key).map(|entry| entry.slot.clone()) {
            Some(Slot::Done(receipt)) => Reservation::Replay(receipt),
            Some(Slot::Reserved) => Reservation::InFlight,
            None => {
                local.insert(
                    key,
                    LocalEntry {
                        slot: Slot::Reserved,
                        expires_at: now + Duration::from_secs(self.reservation_ttl()),
                    },
                );
                Reservation::Acquired
            }
        }
    }

    /// Stores the receipt under a reserved key for the full TTL.
    pub async fn complete(&self, seller_id: Uuid, key: &str, receipt: &SubmitReceipt) {
        let key = Self::scoped(seller_id, key);
        if let Some(client) = &self.redis {
            redis_set(client, &key, receipt, self.ttl_secs).await;
            return;
        }
        self.local.lock().await.insert(
            key,
            LocalEntry {
                slot: Slot::Done(receipt.clone()),
                expires_at: Instant::now() + Duration::from_secs(self.ttl_secs),
            },
        );
    }

    /// Frees a reserved key after a submission that did not go through.
    pub async fn release(&self, seller_id: Uuid, key: &str) {
        let key = Self::scoped(seller_id, key);
        if let Some(client) = &self.redis {
            if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                let _: Result<(), _> = conn.del(&key).await;
            }
            return;
        }
        let mut local = self.local.lock().await;
        if matches!(local.get(&key).map(|e| &e.slot), Some(Slot::Reserved)) {
            local.remove(&key);
        }
    }

    #[cfg(test)]
    async fn local_entries(&self) -> usize {
        self.local.lock().await.len()
    }
}

async fn redis_reserve(client: &redis::Client, key: &str, ttl_secs: u64) -> Reservation {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "resale.request", error = %err, "idempotency reservation skipped");
            return Reservation::Acquired;
        }
    };
    let set: Result<Option<String>, _> = redis::cmd("SET")
        .arg(key)
        .arg(RESERVED)
        .arg("NX")
        .arg("EX")
        .arg(ttl_secs)
        .query_async(&mut conn)
        .await;
    match set {
        Ok(Some(_)) => Reservation::Acquired,
        Ok(None) => {
            let existing: Result<Option<String>, _> = conn.get(key).await;
            let receipt = existing
                .ok()
                .flatten()
                .and_then(|v| serde_json::from_str::<SubmitReceipt>(&v).ok());
            match receipt {
                Some(receipt) => Reservation::Replay(receipt),
                None => Reservation::InFlight,
            }
        }
        Err(err) => {
            warn!(target = "resale.request", error = %err, "idempotency reservation skipped");
            Reservation::Acquired
        }
    }
}

async fn redis_set(client: &redis::Client, key: &str, value: &SubmitReceipt, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}
