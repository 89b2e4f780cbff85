// The provider "port". Each storage provider implements `ProviderAdapter`
// against its native API (see infra/providers). The core only ever talks to
// this trait and picks an implementation once per connection through the
// `ProviderRegistry`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::classification::{classify_hints, ClassificationHints};
use super::storage_error::GatewayError;
use super::storage_models::{
    ConnectionPermissions, Domain, KnowledgeDocumentMeta, Provider, StorageConnection,
};
use super::upload::UploadSession;

/// What the token endpoint gave back for a code exchange or refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Providers may omit this on refresh; the old one stays valid then.
    pub refresh_token: Option<String>,
    pub expires_in_secs: i64,
    pub scope: Option<String>,
    /// Workspace tenant, when the provider reports one.
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub max_docs: usize,
    /// Empty means every domain.
    pub domains: Vec<Domain>,
    /// Track every returned document for compliance (best effort).
    pub track_compliance: bool,
}

impl SearchOptions {
    /// How many hits to ask a provider for, given its page cap.
    ///
    /// The domain filter runs after the provider answers, so a filtered search
    /// asks for a full page and lets the gateway truncate.
    pub fn provider_page_size(&self, cap: usize) -> usize {
        if self.domains.is_empty() {
            self.max_docs.clamp(1, cap)
        } else {
            cap
        }
    }
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_docs: 25,
            domains: Vec::new(),
            track_compliance: false,
        }
    }
}

/// Everything needed to open a resumable upload session.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTarget {
    pub folder_id: String,
    pub file_name: String,
    pub mime: String,
    pub byte_length: u64,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Builds the URL the user is sent to for consent.
    fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, GatewayError>;

    /// Exchanges an authorization code for tokens.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, GatewayError>;

    /// Uses a refresh token. A rejected grant must come back as `AuthExpired`.
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, GatewayError>;

    /// Maps the scopes granted at consent to gateway permissions.
    fn permissions_for(&self, granted_scope: Option<&str>) -> ConnectionPermissions;

    /// Runs the provider's native search over the connection's folders.
    /// Never downloads file content.
    async fn search(
        &self,
        connection: &StorageConnection,
        access_token: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<KnowledgeDocumentMeta>, GatewayError>;

    /// Downloads a file into memory. The caller owns the only reference.
    async fn fetch_bytes(
        &self,
        connection: &StorageConnection,
        access_token: &str,
        file_id: &str,
    ) -> Result<Vec<u8>, GatewayError>;

    /// Opens a resumable upload session; chunks are driven by `ChunkedUploader`.
    async fn open_upload_session(
        &self,
        connection: &StorageConnection,
        access_token: &str,
        target: &UploadTarget,
    ) -> Result<Box<dyn UploadSession>, GatewayError>;

    /// Same heuristic `search` uses, without any I/O.
    fn classify_hints(&self, file_name: &str, mime: &str) -> ClassificationHints {
        classify_hints(file_name, mime)
    }
}

/// Looks up the adapter for a provider. Built once at startup.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        tracing::info!(provider = %adapter.provider(), "Registered storage provider");
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>, GatewayError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| GatewayError::ProviderNotConfigured(provider.to_string()))
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.adapters.keys().copied().collect()
    }
}
