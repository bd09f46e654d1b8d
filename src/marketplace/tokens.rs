use crate::marketplace::auth::{AuthError, TokenEndpoint, TokenGrant};
use crate::models::{Credential, CredentialScope};
use crate::store::CredentialStore;
use chrono::{Duration, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// In-memory credential cache plus the per-scope locks that make refresh single-flight.
///
/// Injected into `TokenManager` so tests (and separate engines in one process) each get
/// their own isolated cache.
#[derive(Default)]
pub struct TokenCache {
    entries: RwLock<HashMap<CredentialScope, Credential>>,
    flights: Mutex<HashMap<CredentialScope, Arc<Mutex<()>>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, scope: CredentialScope) -> Option<Credential> {
        self.entries.read().await.get(&scope).cloned()
    }

    pub async fn put(&self, credential: Credential) {
        self.entries
            .write()
            .await
            .insert(credential.scope, credential);
    }

    pub async fn evict(&self, scope: CredentialScope) {
        self.entries.write().await.remove(&scope);
    }

    async fn flight(&self, scope: CredentialScope) -> Arc<Mutex<()>> {
        self.flights
            .lock()
            .await
            .entry(scope)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forgets the scope's lock once no other caller holds or waits on it.
    async fn land(&self, scope: CredentialScope, flight: Arc<Mutex<()>>) {
        let mut flights = self.flights.lock().await;
        if let Some(entry) = flights.get(&scope)
            && Arc::ptr_eq(entry, &flight)
            && Arc::strong_count(&flight) == 2
        {
            flights.remove(&scope);
        }
    }

    #[cfg(test)]
    pub(crate) async fn flights_in_use(&self) -> usize {
        self.flights.lock().await.len()
    }
}

pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    cache: Arc<TokenCache>,
    app_refresh_token: String,
    skew: Duration,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        cache: Arc<TokenCache>,
        app_refresh_token: impl Into<String>,
        skew: Duration,
    ) -> Self {
        Self {
            store,
            endpoint,
            cache,
            app_refresh_token: app_refresh_token.into(),
            skew,
        }
    }

    /// Returns an access token for `scope` that stays valid for at least the skew window.
    ///
    /// Refreshes at most once per scope no matter how many callers arrive while the token
    /// is expiring. A failed refresh is an error; a stale token is never handed out.
    pub async fn get_valid_token(&self, scope: CredentialScope) -> Result<String, AuthError> {
        if let Some(credential) = self.cache.get(scope).await
            && self.usable(&credential)?
        {
            return Ok(credential.access_token);
        }

        let flight = self.cache.flight(scope).await;
        let token = {
            let _guard = flight.lock().await;
            self.load_or_refresh(scope).await
        };
        self.cache.land(scope, flight).await;
        token
    }

    async fn load_or_refresh(&self, scope: CredentialScope) -> Result<String, AuthError> {
        // Another caller may have refreshed while we waited, in this process or elsewhere.
        if let Some(credential) = self.cache.get(scope).await
            && self.usable(&credential)?
        {
            return Ok(credential.access_token);
        }
        let stored = self
            .store
            .load_credential(scope)
            .await
            .map_err(|err| AuthError::Store(err.to_string()))?;
        if let Some(credential) = stored.as_ref()
            && self.usable(credential)?
        {
            self.cache.put(credential.clone()).await;
            return Ok(credential.access_token.clone());
        }

        self.refresh(scope, stored).await
    }

    /// Persists tokens obtained by an authorization flow that ran elsewhere.
    /// Clears any broken-connection marker.
    pub async fn store_grant(
        &self,
        scope: CredentialScope,
        grant: TokenGrant,
    ) -> Result<Credential, AuthError> {
        let refresh_token = match scope {
            CredentialScope::Application => self.app_refresh_token.clone(),
            CredentialScope::Seller(_) => grant
                .refresh_token
                .clone()
                .ok_or_else(|| AuthError::Rejected("grant without refresh token".into()))?,
        };
        let credential = Credential {
            scope,
            access_token: grant.access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(grant.expires_in),
            connection_broken_at: None,
            broken_reason: None,
        };
        self.store
            .save_credential(&credential)
            .await
            .map_err(|err| AuthError::Store(err.to_string()))?;
        self.cache.put(credential.clone()).await;
        Ok(credential)
    }

    pub async fn disconnect(&self, seller_id: Uuid) -> Result<(), AuthError> {
        let scope = CredentialScope::Seller(seller_id);
        self.store
            .delete_credential(scope)
            .await
            .map_err(|err| AuthError::Store(err.to_string()))?;
        self.cache.evict(scope).await;
        info!(target = "resale.tokens", %seller_id, "seller disconnected");
        Ok(())
    }

    /// Records a rejected credential so the seller gets prompted to reconnect.
    pub async fn mark_broken(&self, seller_id: Uuid, reason: &str) {
        let scope = CredentialScope::Seller(seller_id);
        if let Err(err) = self
            .store
            .mark_connection_broken(seller_id, reason, Utc::now())
            .await
        {
            warn!(target = "resale.tokens", %seller_id, error = %err, "mark_connection_broken_failed");
        }
        self.cache.evict(scope).await;
    }

    fn usable(&self, credential: &Credential) -> Result<bool, AuthError> {
        if credential.connection_broken_at.is_some() {
            return Err(AuthError::ConnectionBroken(credential.scope.to_string()));
        }
        Ok(!credential.needs_refresh(Utc::now(), self.skew))
    }

    async fn refresh(
        &self,
        scope: CredentialScope,
        current: Option<Credential>,
    ) -> Result<String, AuthError> {
        let refresh_token = match (scope, current.as_ref()) {
            (CredentialScope::Application, _) => {
                if self.app_refresh_token.is_empty() {
                    return Err(AuthError::MissingCredentials);
                }
                self.app_refresh_token.clone()
            }
            (CredentialScope::Seller(_), Some(credential)) => credential.refresh_token.clone(),
            (CredentialScope::Seller(_), None) => {
                return Err(AuthError::NotConnected(scope.to_string()));
            }
        };

        debug!(target = "resale.tokens", scope = %scope, "refreshing access token");
        let grant = match self.endpoint.refresh(&refresh_token).await {
            Ok(grant) => grant,
            Err(err) => {
                warn!(target = "resale.tokens", scope = %scope, error = %err, "token_refresh_failed");
                if let (AuthError::Rejected(reason), Some(seller_id)) = (&err, scope.seller_id()) {
                    self.mark_broken(seller_id, reason).await;
                }
                return Err(err);
            }
        };

        let rotated_refresh = match scope {
            CredentialScope::Application => refresh_token,
            CredentialScope::Seller(_) => grant.refresh_token.unwrap_or(refresh_token),
        };
        let credential = Credential {
            scope,
            access_token: grant.access_token,
            refresh_token: rotated_refresh,
            expires_at: Utc::now() + Duration::seconds(grant.expires_in),
            connection_broken_at: None,
            broken_reason: None,
        };
        self.store
            .save_credential(&credential)
            .await
            .map_err(|err| AuthError::Store(err.to_string()))?;
        self.cache.put(credential.clone()).await;
        info!(
            target = "resale.tokens",
            scope = %scope,
            expires_at = %credential.expires_at,
            "access token refreshed"
        );
        Ok(credential.access_token)
    }
}
