// Connection Manager: owns the OAuth2 consent flow and the lifecycle of
// `StorageConnection` records.
//
// **Flow:**
// Initiated -> AwaitingCallback -> Verified -> Connected
//                    \-> Failed (state mismatch/replay, code exchange error)
//
// The state nonce is random, stored server-side and consumed exactly once. A
// failed attempt never leaves a connection behind.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::connection_store::{ConnectionStore, PendingOAuthState};
use super::token_vault::TokenVault;
use crate::core::storage::{
    GatewayError, OAuthTokens, Provider, ProviderRegistry, StorageConnection,
};

const STATE_NONCE_BYTES: usize = 32;

/// Phases of one consent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Initiated,
    AwaitingCallback,
    Verified,
    Connected,
    Failed,
}

impl AttemptPhase {
    fn can_advance_to(self, next: AttemptPhase) -> bool {
        use AttemptPhase::*;
        matches!(
            (self, next),
            (Initiated, AwaitingCallback)
                | (AwaitingCallback, Verified)
                | (Verified, Connected)
                | (Initiated | AwaitingCallback | Verified, Failed)
        )
    }
}

/// Tracks one attempt through its phases and logs each transition.
struct ConnectionAttempt {
    phase: AttemptPhase,
    provider: Provider,
}

impl ConnectionAttempt {
    fn start(provider: Provider, phase: AttemptPhase) -> Self {
        Self { phase, provider }
    }

    fn advance(&mut self, next: AttemptPhase) -> Result<(), GatewayError> {
        if !self.phase.can_advance_to(next) {
            return Err(GatewayError::InvalidState(format!(
                "cannot move from {:?} to {:?}",
                self.phase, next
            )));
        }
        tracing::debug!(provider = %self.provider, from = ?self.phase, to = ?next, "OAuth attempt");
        self.phase = next;
        Ok(())
    }

    /// Marks the attempt failed and hands the error back.
    fn fail(&mut self, err: GatewayError) -> GatewayError {
        tracing::warn!(provider = %self.provider, phase = ?self.phase, "OAuth attempt failed: {}", err);
        self.phase = AttemptPhase::Failed;
        err
    }
}

/// Where to send the user for consent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub authorization_url: String,
    pub state: String,
}

/// What the provider's redirect handed back, plus the user's folder choice.
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthCallback {
    pub provider: Provider,
    pub state: String,
    pub code: String,
    pub redirect_uri: String,
    pub selected_folder_ids: Vec<String>,
    pub template_folder_id: Option<String>,
}

pub struct ConnectionManager {
    store: Arc<dyn ConnectionStore>,
    providers: Arc<ProviderRegistry>,
    vault: Arc<TokenVault>,
    state_ttl: Duration,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        providers: Arc<ProviderRegistry>,
        vault: Arc<TokenVault>,
        state_ttl: Duration,
    ) -> Self {
        Self {
            store,
            providers,
            vault,
            state_ttl,
        }
    }

    /// Starts a consent flow and returns the provider's authorization URL.
    pub async fn initiate_oauth_connection(
        &self,
        user_id: &str,
        provider: Provider,
        redirect_uri: &str,
    ) -> Result<AuthorizationRequest, GatewayError> {
        if redirect_uri.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "redirect_uri must not be empty".to_string(),
            ));
        }

        let adapter = self.providers.get(provider)?;
        let mut attempt = ConnectionAttempt::start(provider, AttemptPhase::Initiated);

        let nonce = generate_state_nonce();
        let authorization_url = adapter.authorization_url(redirect_uri, &nonce)?;

        let now = Utc::now();
        // Abandoned consent flows never call back; expire them here.
        let purged = self.store.purge_pending_states(now - self.state_ttl).await?;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired OAuth states");
        }

        self.store
            .save_pending_state(&PendingOAuthState {
                nonce: nonce.clone(),
                user_id: user_id.to_string(),
                provider,
                redirect_uri: redirect_uri.to_string(),
                created_at: now,
            })
            .await?;
        attempt.advance(AttemptPhase::AwaitingCallback)?;

        tracing::info!(user_id, provider = %provider, "Started OAuth connection");

        Ok(AuthorizationRequest {
            authorization_url,
            state: nonce,
        })
    }

    /// Finishes a consent flow: verifies the state, exchanges the code and
    /// upserts the connection for (user, provider).
    pub async fn complete_oauth_connection(
        &self,
        user_id: &str,
        callback: OAuthCallback,
    ) -> Result<StorageConnection, GatewayError> {
        let folder_ids = normalize_folders(&callback.selected_folder_ids)?;
        let adapter = self.providers.get(callback.provider)?;
        let mut attempt = ConnectionAttempt::start(callback.provider, AttemptPhase::AwaitingCallback);

        let pending = self
            .store
            .take_pending_state(&callback.state)
            .await?
            .ok_or_else(|| {
                attempt.fail(GatewayError::InvalidState(
                    "unknown or already used state".to_string(),
                ))
            })?;

        if pending.user_id != user_id
            || pending.provider != callback.provider
            || pending.redirect_uri != callback.redirect_uri
        {
            return Err(attempt.fail(GatewayError::InvalidState(
                "state does not match this callback".to_string(),
            )));
        }
        if Utc::now() - pending.created_at > self.state_ttl {
            return Err(attempt.fail(GatewayError::InvalidState("state expired".to_string())));
        }

        let grant = match adapter
            .exchange_code(&callback.code, &callback.redirect_uri)
            .await
        {
            Ok(grant) => grant,
            Err(GatewayError::AuthExpired(reason)) => {
                return Err(attempt.fail(GatewayError::InvalidState(reason)))
            }
            Err(e) => return Err(attempt.fail(e)),
        };
        attempt.advance(AttemptPhase::Verified)?;

        let existing = self
            .store
            .find_by_user_and_provider(user_id, callback.provider)
            .await?;

        let refresh_token = match grant.refresh_token.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => match &existing {
                Some(conn) => conn.oauth_tokens.refresh_token.clone(),
                None => {
                    return Err(attempt.fail(GatewayError::InvalidState(
                        "provider did not issue a refresh token".to_string(),
                    )))
                }
            },
        };

        let now = Utc::now();
        let connection = StorageConnection {
            id: existing
                .as_ref()
                .map(|c| c.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: user_id.to_string(),
            provider: callback.provider,
            tenant_id: grant
                .tenant_id
                .or_else(|| existing.as_ref().and_then(|c| c.tenant_id.clone())),
            folder_ids,
            template_folder_id: callback.template_folder_id,
            oauth_tokens: OAuthTokens {
                access_token: grant.access_token,
                refresh_token,
                expires_at_epoch_ms: (now + Duration::seconds(grant.expires_in_secs))
                    .timestamp_millis(),
            },
            permissions: adapter.permissions_for(grant.scope.as_deref()),
            created_at: existing.as_ref().map(|c| c.created_at).unwrap_or(now),
            last_used_at: now,
        };

        let stored = self.store.upsert(connection).await?;
        attempt.advance(AttemptPhase::Connected)?;

        tracing::info!(
            user_id,
            connection_id = %stored.id,
            provider = %stored.provider,
            folders = stored.folder_ids.len(),
            "Storage connection established"
        );

        Ok(stored)
    }

    pub async fn list_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<StorageConnection>, GatewayError> {
        self.store.list_for_user(user_id).await
    }

    /// Loads a connection, treating someone else's connection as missing.
    pub async fn get_for_user(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<StorageConnection, GatewayError> {
        let connection = self.store.require(connection_id).await?;
        if connection.user_id != user_id {
            return Err(GatewayError::ConnectionNotFound(connection_id.to_string()));
        }
        Ok(connection)
    }

    /// Explicit user disconnect: the only way a connection is deleted.
    pub async fn disconnect(&self, user_id: &str, connection_id: &str) -> Result<(), GatewayError> {
        self.get_for_user(user_id, connection_id).await?;
        self.store.delete(connection_id).await?;
        self.vault.forget(connection_id);

        tracing::info!(user_id, connection_id, "Storage connection removed");
        Ok(())
    }

    /// Replaces the set of folders the connection may search and write to.
    pub async fn update_folders(
        &self,
        user_id: &str,
        connection_id: &str,
        folder_ids: &[String],
        template_folder_id: Option<&str>,
    ) -> Result<StorageConnection, GatewayError> {
        let folder_ids = normalize_folders(folder_ids)?;
        self.get_for_user(user_id, connection_id).await?;

        if !self
            .store
            .update_folders(connection_id, &folder_ids, template_folder_id)
            .await?
        {
            return Err(GatewayError::ConnectionNotFound(connection_id.to_string()));
        }
        self.store.require(connection_id).await
    }
}

/// Cryptographically random, URL-safe state nonce.
fn generate_state_nonce() -> String {
    let mut bytes = [0u8; STATE_NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Trims and dedupes folder ids; an empty selection is rejected.
fn normalize_folders(folder_ids: &[String]) -> Result<Vec<String>, GatewayError> {
    let mut out: Vec<String> = Vec::new();
    for id in folder_ids.iter().map(|f| f.trim()).filter(|f| !f.is_empty()) {
        if !out.iter().any(|existing| existing == id) {
            out.push(id.to_string());
        }
    }
    if out.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "select at least one folder".to_string(),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::test_support::{FixtureProvider, VALID_CODE};
    use crate::core::storage::ProviderAdapter;
    use crate::infra::storage::InMemoryConnectionStore;

    const REDIRECT: &str = "https://app/cb";

    fn manager() -> (ConnectionManager, Arc<InMemoryConnectionStore>) {
        let mut registry = ProviderRegistry::new();
        registry.register(
            Arc::new(FixtureProvider::new(Provider::DriveService)) as Arc<dyn ProviderAdapter>
        );
        let registry = Arc::new(registry);

        let store = Arc::new(InMemoryConnectionStore::new());
        let vault = Arc::new(TokenVault::new(
            store.clone(),
            registry.clone(),
            Duration::seconds(60),
        ));
        let manager = ConnectionManager::new(store.clone(), registry, vault, Duration::minutes(10));
        (manager, store)
    }

    fn callback(state: &str, code: &str, folders: &[&str]) -> OAuthCallback {
        OAuthCallback {
            provider: Provider::DriveService,
            state: state.to_string(),
            code: code.to_string(),
            redirect_uri: REDIRECT.to_string(),
            selected_folder_ids: folders.iter().map(|f| f.to_string()).collect(),
            template_folder_id: None,
        }
    }

    #[test]
    fn test_phase_transitions() {
        assert!(AttemptPhase::Initiated.can_advance_to(AttemptPhase::AwaitingCallback));
        assert!(AttemptPhase::Verified.can_advance_to(AttemptPhase::Connected));
        assert!(AttemptPhase::AwaitingCallback.can_advance_to(AttemptPhase::Failed));
        assert!(!AttemptPhase::AwaitingCallback.can_advance_to(AttemptPhase::Connected));
        assert!(!AttemptPhase::Failed.can_advance_to(AttemptPhase::Verified));
        assert!(!AttemptPhase::Connected.can_advance_to(AttemptPhase::Failed));
    }

    #[test]
    fn test_state_nonce_is_random_and_url_safe() {
        let a = generate_state_nonce();
        let b = generate_state_nonce();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn test_full_flow_creates_connection() {
        let (manager, _) = manager();

        let request = manager
            .initiate_oauth_connection("user-1", Provider::DriveService, REDIRECT)
            .await
            .unwrap();
        assert!(request.authorization_url.contains(&request.state));

        let connection = manager
            .complete_oauth_connection("user-1", callback(&request.state, VALID_CODE, &["folderA"]))
            .await
            .unwrap();

        assert_eq!(connection.provider, Provider::DriveService);
        assert_eq!(connection.folder_ids, vec!["folderA".to_string()]);
        assert!(!connection.oauth_tokens.refresh_token.is_empty());
    }

    #[tokio::test]
    async fn test_starting_a_flow_purges_abandoned_states() {
        let (manager, store) = manager();
        store
            .save_pending_state(&PendingOAuthState {
                nonce: "abandoned".to_string(),
                user_id: "user-2".to_string(),
                provider: Provider::DriveService,
                redirect_uri: REDIRECT.to_string(),
                created_at: Utc::now() - Duration::hours(2),
            })
            .await
            .unwrap();

        let request = manager
            .initiate_oauth_connection("user-1", Provider::DriveService, REDIRECT)
            .await
            .unwrap();

        assert!(store.take_pending_state("abandoned").await.unwrap().is_none());
        assert!(store.take_pending_state(&request.state).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_state_cannot_be_replayed() {
        let (manager, _) = manager();
        let request = manager
            .initiate_oauth_connection("user-1", Provider::DriveService, REDIRECT)
            .await
            .unwrap();

        manager
            .complete_oauth_connection("user-1", callback(&request.state, VALID_CODE, &["f"]))
            .await
            .unwrap();
        let err = manager
            .complete_oauth_connection("user-1", callback(&request.state, VALID_CODE, &["f"]))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_state_from_another_user_is_rejected() {
        let (manager, store) = manager();
        let request = manager
            .initiate_oauth_connection("user-1", Provider::DriveService, REDIRECT)
            .await
            .unwrap();

        let err = manager
            .complete_oauth_connection("user-2", callback(&request.state, VALID_CODE, &["f"]))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::InvalidState(_)));
        assert!(store.list_for_user("user-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_exchange_leaves_no_connection() {
        let (manager, store) = manager();
        let request = manager
            .initiate_oauth_connection("user-1", Provider::DriveService, REDIRECT)
            .await
            .unwrap();

        let err = manager
            .complete_oauth_connection("user-1", callback(&request.state, "bad-code", &["f"]))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::InvalidState(_)));
        assert!(store.list_for_user("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_updates_the_same_connection() {
        let (manager, _) = manager();

        let mut ids = Vec::new();
        for folder in ["a", "b"] {
            let request = manager
                .initiate_oauth_connection("user-1", Provider::DriveService, REDIRECT)
                .await
                .unwrap();
            let connection = manager
                .complete_oauth_connection("user-1", callback(&request.state, VALID_CODE, &[folder]))
                .await
                .unwrap();
            ids.push(connection.id);
        }

        assert_eq!(ids[0], ids[1]);
        let all = manager.list_connections("user-1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].folder_ids, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_folder_selection_is_rejected() {
        let (manager, _) = manager();
        let err = manager
            .complete_oauth_connection("user-1", callback("whatever", VALID_CODE, &[" "]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_provider() {
        let (manager, _) = manager();
        let err = manager
            .initiate_oauth_connection("user-1", Provider::WorkspacePlatform, REDIRECT)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProviderNotConfigured(_)));
    }

    #[tokio::test]
    async fn test_disconnect_and_folder_updates_are_owner_only() {
        let (manager, store) = manager();
        let request = manager
            .initiate_oauth_connection("user-1", Provider::DriveService, REDIRECT)
            .await
            .unwrap();
        let connection = manager
            .complete_oauth_connection("user-1", callback(&request.state, VALID_CODE, &["a"]))
            .await
            .unwrap();

        let updated = manager
            .update_folders("user-1", &connection.id, &["a".into(), "c".into(), "a".into()], Some("t"))
            .await
            .unwrap();
        assert_eq!(updated.folder_ids, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(updated.template_folder_id.as_deref(), Some("t"));

        let err = manager.disconnect("user-2", &connection.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionNotFound(_)));

        manager.disconnect("user-1", &connection.id).await.unwrap();
        assert!(store.get(&connection.id).await.unwrap().is_none());
    }
}
