// Fakes shared by the core tests: a provider adapter backed by fixture files
// and an upload session that records every chunk it is handed.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::classification::{ComplianceThresholds, ProviderFile};
use super::provider::{ProviderAdapter, SearchOptions, TokenGrant, UploadTarget};
use super::storage_error::GatewayError;
use super::storage_models::{
    ConnectionPermissions, KnowledgeDocumentMeta, OAuthTokens, Provider, StorageConnection,
    StoragePointer,
};
use super::upload::{ChunkOutcome, ChunkRange, UploadSession};

pub const VALID_CODE: &str = "code123";

pub fn sample_pointer(file_id: &str) -> StoragePointer {
    StoragePointer {
        provider: Provider::DriveService,
        drive_id: "my-drive".to_string(),
        file_id: file_id.to_string(),
        web_url: format!("https://drive.example/{}", file_id),
        path: None,
        version: None,
        acl_hash: "acl".to_string(),
    }
}

pub fn sample_connection(id: &str, provider: Provider, folder_ids: &[&str]) -> StorageConnection {
    let now = Utc::now();
    StorageConnection {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        provider,
        tenant_id: None,
        folder_ids: folder_ids.iter().map(|f| f.to_string()).collect(),
        template_folder_id: None,
        oauth_tokens: OAuthTokens {
            access_token: "access-0".to_string(),
            refresh_token: "refresh-0".to_string(),
            expires_at_epoch_ms: (now + ChronoDuration::hours(1)).timestamp_millis(),
        },
        permissions: ConnectionPermissions::default(),
        created_at: now,
        last_used_at: now,
    }
}

// ============================================================================
// RECORDING UPLOAD SESSION
// ============================================================================

pub struct RecordingSession {
    pointer: StoragePointer,
    ranges: Mutex<Vec<ChunkRange>>,
    received: Mutex<Vec<u8>>,
    fail_at: Option<usize>,
    transient_remaining: AtomicUsize,
    delay: Option<Duration>,
    auth_expired: bool,
    cancelled: AtomicBool,
}

impl RecordingSession {
    pub fn new(pointer: StoragePointer) -> Self {
        Self {
            pointer,
            ranges: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            fail_at: None,
            transient_remaining: AtomicUsize::new(0),
            delay: None,
            auth_expired: false,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Chunk `index` always fails with a retryable error.
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// The first `count` requests fail with a retryable error.
    pub fn transient_failures(self, count: usize) -> Self {
        self.transient_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn auth_expired(mut self) -> Self {
        self.auth_expired = true;
        self
    }

    pub fn ranges(&self) -> Vec<ChunkRange> {
        self.ranges.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadSession for RecordingSession {
    async fn put_chunk(
        &self,
        range: ChunkRange,
        chunk: &[u8],
    ) -> Result<ChunkOutcome, GatewayError> {
        let index = {
            let mut ranges = self.ranges.lock().unwrap();
            ranges.push(range);
            ranges.iter().map(|r| r.start).collect::<HashSet<_>>().len() - 1
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.auth_expired {
            return Err(GatewayError::AuthExpired("token revoked".to_string()));
        }
        if self
            .transient_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::ProviderUnavailable("503".to_string()));
        }
        if self.fail_at == Some(index) {
            return Err(GatewayError::ProviderUnavailable("simulated".to_string()));
        }

        self.received.lock().unwrap().extend_from_slice(chunk);
        if range.is_last() {
            Ok(ChunkOutcome::Complete(self.pointer.clone()))
        } else {
            Ok(ChunkOutcome::Incomplete)
        }
    }

    async fn cancel(&self) -> Result<(), GatewayError> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct SharedSession(Arc<RecordingSession>);

#[async_trait]
impl UploadSession for SharedSession {
    async fn put_chunk(
        &self,
        range: ChunkRange,
        chunk: &[u8],
    ) -> Result<ChunkOutcome, GatewayError> {
        self.0.put_chunk(range, chunk).await
    }

    async fn cancel(&self) -> Result<(), GatewayError> {
        self.0.cancel().await
    }
}

// ============================================================================
// FIXTURE PROVIDER
// ============================================================================

#[derive(Debug, Clone)]
pub struct FixtureFile {
    pub file_id: String,
    pub name: String,
    pub mime: String,
    pub folder_id: String,
    pub last_modified: DateTime<Utc>,
    pub content: Vec<u8>,
}

impl FixtureFile {
    pub fn new(file_id: &str, name: &str, folder_id: &str, content: &[u8]) -> Self {
        Self {
            file_id: file_id.to_string(),
            name: name.to_string(),
            mime: "application/msword".to_string(),
            folder_id: folder_id.to_string(),
            last_modified: Utc::now() - ChronoDuration::days(10),
            content: content.to_vec(),
        }
    }
}

pub struct FixtureProvider {
    provider: Provider,
    files: Vec<FixtureFile>,
    refresh_delay: Duration,
    refresh_rejected: bool,
    fail_uploads: bool,
    pub refresh_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub sessions: Mutex<Vec<Arc<RecordingSession>>>,
}

impl FixtureProvider {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            files: Vec::new(),
            refresh_delay: Duration::ZERO,
            refresh_rejected: false,
            fail_uploads: false,
            refresh_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_file(mut self, file: FixtureFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn rejecting_refresh(mut self) -> Self {
        self.refresh_rejected = true;
        self
    }

    pub fn failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn last_session(&self) -> Option<Arc<RecordingSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ProviderAdapter for FixtureProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, GatewayError> {
        Ok(format!(
            "https://auth.example/authorize?redirect_uri={}&state={}",
            redirect_uri, state
        ))
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenGrant, GatewayError> {
        if code != VALID_CODE {
            return Err(GatewayError::InvalidState(
                "authorization code rejected".to_string(),
            ));
        }
        Ok(TokenGrant {
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_in_secs: 3600,
            scope: None,
            tenant_id: None,
        })
    }

    async fn refresh_access_token(
        &self,
        _refresh_token: &str,
    ) -> Result<TokenGrant, GatewayError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.refresh_delay).await;

        if self.refresh_rejected {
            return Err(GatewayError::AuthExpired("invalid_grant".to_string()));
        }
        Ok(TokenGrant {
            access_token: format!("refreshed-{}", n),
            refresh_token: Some(format!("rotated-{}", n)),
            expires_in_secs: 3600,
            scope: None,
            tenant_id: None,
        })
    }

    fn permissions_for(&self, _granted_scope: Option<&str>) -> ConnectionPermissions {
        ConnectionPermissions::default()
    }

    async fn search(
        &self,
        connection: &StorageConnection,
        _access_token: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<KnowledgeDocumentMeta>, GatewayError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let query = query.to_lowercase();
        let now = Utc::now();

        Ok(self
            .files
            .iter()
            .filter(|f| connection.folder_ids.contains(&f.folder_id))
            .filter(|f| f.name.to_lowercase().contains(&query))
            .take(options.provider_page_size(usize::MAX))
            .map(|f| {
                ProviderFile {
                    provider: self.provider,
                    drive_id: "my-drive".to_string(),
                    file_id: f.file_id.clone(),
                    name: f.name.clone(),
                    mime: f.mime.clone(),
                    web_url: format!("https://drive.example/{}", f.file_id),
                    last_modified: f.last_modified,
                    folder_path: None,
                    version: None,
                    permission_ids: vec![],
                }
                .into_meta(
                    &connection.id,
                    ChronoDuration::days(365),
                    &ComplianceThresholds::default(),
                    now,
                )
            })
            .collect())
    }

    async fn fetch_bytes(
        &self,
        _connection: &StorageConnection,
        _access_token: &str,
        file_id: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        self.files
            .iter()
            .find(|f| f.file_id == file_id)
            .map(|f| f.content.clone())
            .ok_or_else(|| GatewayError::InvalidRequest(format!("no file {}", file_id)))
    }

    async fn open_upload_session(
        &self,
        _connection: &StorageConnection,
        _access_token: &str,
        target: &UploadTarget,
    ) -> Result<Box<dyn UploadSession>, GatewayError> {
        let mut pointer = sample_pointer(&format!("generated-{}", target.file_name));
        pointer.provider = self.provider;

        let mut session = RecordingSession::new(pointer);
        if self.fail_uploads {
            session = session.failing_at(0);
        }
        let session = Arc::new(session);
        self.sessions.lock().unwrap().push(session.clone());
        Ok(Box::new(SharedSession(session)))
    }
}
