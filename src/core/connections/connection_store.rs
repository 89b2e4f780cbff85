use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::storage::{GatewayError, OAuthTokens, Provider, StorageConnection};

/// A consent flow that has been started but not yet called back.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOAuthState {
    pub nonce: String,
    pub user_id: String,
    pub provider: Provider,
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence port for connections and pending OAuth states.
///
/// This is the system of record; in-memory implementations only exist for
/// tests and single-process runs.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<StorageConnection>, GatewayError>;

    async fn find_by_user_and_provider(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<StorageConnection>, GatewayError>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<StorageConnection>, GatewayError>;

    /// Inserts the connection, or replaces the row for the same
    /// (user, provider) while keeping its id and creation time.
    async fn upsert(&self, connection: StorageConnection)
        -> Result<StorageConnection, GatewayError>;

    async fn update_tokens(
        &self,
        id: &str,
        tokens: &OAuthTokens,
        used_at: DateTime<Utc>,
    ) -> Result<(), GatewayError>;

    async fn touch(&self, id: &str, used_at: DateTime<Utc>) -> Result<(), GatewayError>;

    /// Returns false when the connection does not exist.
    async fn update_folders(
        &self,
        id: &str,
        folder_ids: &[String],
        template_folder_id: Option<&str>,
    ) -> Result<bool, GatewayError>;

    /// Returns false when the connection did not exist.
    async fn delete(&self, id: &str) -> Result<bool, GatewayError>;

    async fn save_pending_state(&self, state: &PendingOAuthState) -> Result<(), GatewayError>;

    /// Drops pending states created before `cutoff`; returns how many went.
    async fn purge_pending_states(&self, cutoff: DateTime<Utc>) -> Result<u64, GatewayError>;

    /// Removes and returns the state in one step, so a nonce can only be
    /// consumed once.
    async fn take_pending_state(
        &self,
        nonce: &str,
    ) -> Result<Option<PendingOAuthState>, GatewayError>;

    /// Like `get`, but a missing connection is an error.
    async fn require(&self, id: &str) -> Result<StorageConnection, GatewayError> {
        self.get(id)
            .await?
            .ok_or_else(|| GatewayError::ConnectionNotFound(id.to_string()))
    }
}
