// Token Vault: hands out access tokens that are valid for at least the refresh
// skew, refreshing them when needed.
//
// **Single-flight refresh:**
// Most providers rotate the refresh token on use, so two concurrent refreshes
// for the same connection would invalidate each other. Refreshes are
// serialized per connection with a mutex held in a DashMap; whoever wins the
// lock refreshes, everyone else re-reads the stored tokens after it. Different
// connections never share a lock.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::connection_store::ConnectionStore;
use crate::core::storage::{GatewayError, OAuthTokens, ProviderRegistry, StorageConnection};

/// Lower bound on the refresh skew.
pub const MIN_REFRESH_SKEW_SECS: i64 = 60;

pub struct TokenVault {
    store: Arc<dyn ConnectionStore>,
    providers: Arc<ProviderRegistry>,
    skew: Duration,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenVault {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        providers: Arc<ProviderRegistry>,
        skew: Duration,
    ) -> Self {
        Self {
            store,
            providers,
            skew: skew.max(Duration::seconds(MIN_REFRESH_SKEW_SECS)),
            refresh_locks: DashMap::new(),
        }
    }

    pub fn skew(&self) -> Duration {
        self.skew
    }

    /// Returns an access token that stays valid for at least the skew.
    ///
    /// **Errors:**
    /// - `AuthExpired` when the refresh fails for any reason; the caller should
    ///   ask the user to reconnect.
    /// - `ConnectionNotFound` if the connection was deleted meanwhile.
    pub async fn get_valid_access_token(
        &self,
        connection: &StorageConnection,
    ) -> Result<String, GatewayError> {
        let now = Utc::now();
        if connection.oauth_tokens.is_fresh(now, self.skew) {
            self.store.touch(&connection.id, now).await?;
            return Ok(connection.oauth_tokens.access_token.clone());
        }

        let lock = self.refresh_lock(&connection.id);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        let current = self.store.require(&connection.id).await?;
        let now = Utc::now();
        if current.oauth_tokens.is_fresh(now, self.skew) {
            self.store.touch(&current.id, now).await?;
            return Ok(current.oauth_tokens.access_token);
        }

        let tokens = self.refresh(&current).await?;
        self.store
            .update_tokens(&current.id, &tokens, Utc::now())
            .await?;

        tracing::info!(
            connection_id = %current.id,
            provider = %current.provider,
            "Refreshed access token"
        );

        Ok(tokens.access_token)
    }

    async fn refresh(&self, connection: &StorageConnection) -> Result<OAuthTokens, GatewayError> {
        let adapter = self.providers.get(connection.provider)?;

        let grant = adapter
            .refresh_access_token(&connection.oauth_tokens.refresh_token)
            .await
            .map_err(|e| {
                tracing::warn!(
                    connection_id = %connection.id,
                    provider = %connection.provider,
                    "Token refresh failed: {}",
                    e
                );
                match e {
                    GatewayError::AuthExpired(_) => e,
                    other => GatewayError::AuthExpired(other.to_string()),
                }
            })?;

        let now = Utc::now();
        let tokens = OAuthTokens {
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| connection.oauth_tokens.refresh_token.clone()),
            expires_at_epoch_ms: (now + Duration::seconds(grant.expires_in_secs))
                .timestamp_millis(),
        };

        if !tokens.is_fresh(now, self.skew) {
            return Err(GatewayError::AuthExpired(
                "provider issued a token that expires inside the refresh window".to_string(),
            ));
        }

        Ok(tokens)
    }

    /// Drops the refresh lock of a deleted connection.
    pub fn forget(&self, connection_id: &str) {
        self.refresh_locks.remove(connection_id);
    }

    fn refresh_lock(&self, connection_id: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}
