// =============================================================================
// MICROSOFT GRAPH ADAPTER (workspace-platform)
// =============================================================================
//
// Implements `ProviderAdapter` for OneDrive / SharePoint document libraries via
// Microsoft Graph v1.0 and the Microsoft identity platform.
//
// **Flow differences from Drive:**
// - The tenant is only known after consent; it is read from the `tid` claim
//   of the returned id_token.
// - Upload sessions hand back a pre-authorized `uploadUrl`. Chunk PUTs to it
//   must NOT carry the bearer token.
// - Intermediate chunks are acknowledged with `202 Accepted`.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, DecodingKey, Validation};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use super::oauth::{api_status_error, transport_error, OAuthClient, OAuthClientConfig};
use super::{build_clients, parse_timestamp, MetaSettings};
use crate::core::storage::classification::acl_hash;
use crate::core::storage::upload::{ChunkOutcome, ChunkRange, UploadSession};
use crate::core::storage::{
    ConnectionPermissions, GatewayError, KnowledgeDocumentMeta, Provider, ProviderAdapter,
    ProviderFile, SearchOptions, StorageConnection, StoragePointer, TokenGrant, UploadTarget,
};

pub const MICROSOFT_LOGIN_BASE: &str = "https://login.microsoftonline.com";
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com";
pub const DEFAULT_TENANT: &str = "common";

const SCOPES: &[&str] = &["openid", "offline_access", "Files.ReadWrite.All"];
const ITEM_SELECT: &str = "id,name,webUrl,lastModifiedDateTime,eTag,file,folder,parentReference,shared";

/// Graph caps `$top` for search at 1000 as well.
const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct MicrosoftGraphSettings {
    pub client_id: String,
    pub client_secret: String,
    /// `common`, `organizations` or a specific tenant id.
    pub tenant: String,
    pub login_base: String,
    pub api_base: String,
}

impl MicrosoftGraphSettings {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            tenant: DEFAULT_TENANT.to_string(),
            login_base: MICROSOFT_LOGIN_BASE.to_string(),
            api_base: GRAPH_API_BASE.to_string(),
        }
    }
}

// =============================================================================
// GRAPH RESPONSE STRUCTURES
// =============================================================================

#[derive(Debug, Deserialize)]
struct DriveItemList {
    #[serde(default)]
    value: Vec<DriveItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    web_url: String,
    last_modified_date_time: Option<String>,
    e_tag: Option<String>,
    file: Option<FileFacet>,
    folder: Option<serde_json::Value>,
    parent_reference: Option<ItemReference>,
    shared: Option<SharedFacet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    #[serde(default)]
    mime_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemReference {
    drive_id: Option<String>,
    id: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SharedFacet {
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    tid: Option<String>,
}

impl DriveItem {
    fn parent_id(&self) -> Option<&str> {
        self.parent_reference.as_ref().and_then(|p| p.id.as_deref())
    }

    fn drive_id(&self) -> String {
        self.parent_reference
            .as_ref()
            .and_then(|p| p.drive_id.clone())
            .unwrap_or_else(|| "me".to_string())
    }

    fn folder_path(&self) -> Option<String> {
        self.parent_reference
            .as_ref()
            .and_then(|p| p.path.as_deref())
            .and_then(readable_path)
    }

    fn permission_ids(&self) -> Vec<String> {
        self.shared
            .as_ref()
            .and_then(|s| s.scope.clone())
            .into_iter()
            .collect()
    }

    fn into_provider_file(self) -> ProviderFile {
        ProviderFile {
            provider: Provider::WorkspacePlatform,
            drive_id: self.drive_id(),
            folder_path: self.folder_path(),
            permission_ids: self.permission_ids(),
            last_modified: parse_timestamp(self.last_modified_date_time.as_deref()),
            mime: self.file.map(|f| f.mime_type).unwrap_or_default(),
            file_id: self.id,
            name: self.name,
            web_url: self.web_url,
            version: self.e_tag,
        }
    }

    fn into_pointer(self, connection_id: &str) -> StoragePointer {
        StoragePointer {
            provider: Provider::WorkspacePlatform,
            drive_id: self.drive_id(),
            path: self.folder_path(),
            acl_hash: acl_hash(connection_id, &self.id, &self.permission_ids()),
            file_id: self.id,
            web_url: self.web_url,
            version: self.e_tag,
        }
    }
}

/// `/drive/root:/HR/Policies` -> `/HR/Policies`.
fn readable_path(raw: &str) -> Option<String> {
    let (_, path) = raw.split_once(':')?;
    if path.is_empty() {
        Some("/".to_string())
    } else {
        Some(path.to_string())
    }
}

/// OData string literal: single quotes are doubled.
fn odata_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Reads the tenant id from an id_token without verifying it. The token came
/// straight from the token endpoint over TLS; only the claim is needed.
fn tenant_from_id_token(id_token: &str) -> Option<String> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<IdTokenClaims>(id_token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => data.claims.tid,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read tenant from id_token");
            None
        }
    }
}

fn permissions_from_scope(scope: Option<&str>) -> ConnectionPermissions {
    let Some(scope) = scope else {
        return ConnectionPermissions::default();
    };
    // Graph may echo scopes as full resource URIs.
    let granted: Vec<String> = scope
        .split_whitespace()
        .map(|s| s.rsplit('/').next().unwrap_or(s).to_lowercase())
        .collect();
    let has_prefix = |prefix: &str| granted.iter().any(|s| s.starts_with(prefix));

    let write = has_prefix("files.readwrite");
    let read = write || has_prefix("files.read");
    ConnectionPermissions {
        read,
        write,
        search: read,
    }
}

// =============================================================================
// ADAPTER
// =============================================================================

pub struct MicrosoftGraphAdapter {
    http: Client,
    upload_http: Client,
    oauth: OAuthClient,
    api_base: String,
    meta: MetaSettings,
}

impl MicrosoftGraphAdapter {
    pub fn new(settings: MicrosoftGraphSettings, meta: MetaSettings) -> Result<Self, GatewayError> {
        let (http, upload_http) = build_clients()?;
        let login_base = settings.login_base.trim_end_matches('/');
        let oauth = OAuthClient::new(
            http.clone(),
            OAuthClientConfig {
                client_id: settings.client_id,
                client_secret: settings.client_secret,
                authorize_url: format!("{}/{}/oauth2/v2.0/authorize", login_base, settings.tenant),
                token_url: format!("{}/{}/oauth2/v2.0/token", login_base, settings.tenant),
                scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
                extra_authorize_params: vec![("response_mode".to_string(), "query".to_string())],
                scope_on_refresh: true,
            },
        );

        Ok(Self {
            http,
            upload_http,
            oauth,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            meta,
        })
    }

    /// `{api_base}/v1.0/me/drive/...` with each segment percent-encoded.
    fn drive_url(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| GatewayError::InvalidRequest(format!("bad graph base URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::InvalidRequest("graph base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["v1.0", "me", "drive"])
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ProviderAdapter for MicrosoftGraphAdapter {
    fn provider(&self) -> Provider {
        Provider::WorkspacePlatform
    }

    fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, GatewayError> {
        self.oauth.authorization_url(redirect_uri, state)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, GatewayError> {
        let response = self.oauth.exchange_code(code, redirect_uri).await?;
        let tenant = response.id_token.as_deref().and_then(tenant_from_id_token);
        Ok(response.into_grant(tenant))
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, GatewayError> {
        let response = self.oauth.refresh(refresh_token).await?;
        let tenant = response.id_token.as_deref().and_then(tenant_from_id_token);
        Ok(response.into_grant(tenant))
    }

    fn permissions_for(&self, granted_scope: Option<&str>) -> ConnectionPermissions {
        permissions_from_scope(granted_scope)
    }

    async fn search(
        &self,
        connection: &StorageConnection,
        access_token: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<KnowledgeDocumentMeta>, GatewayError> {
        let search_segment = format!("search(q='{}')", odata_literal(query));
        let mut url = self.drive_url(&["root", &search_segment])?;
        url.query_pairs_mut()
            .append_pair("$select", ITEM_SELECT)
            .append_pair("$top", &MAX_PAGE_SIZE.to_string());

        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error("graph search", e))?;
        if !response.status().is_success() {
            return Err(api_status_error(response.status(), "graph search"));
        }
        let list: DriveItemList = response
            .json()
            .await
            .map_err(|e| transport_error("graph search", e))?;

        // Graph searches the whole drive; keep only direct children of the
        // authorized folders.
        let now = Utc::now();
        Ok(list
            .value
            .into_iter()
            .filter(|item| item.folder.is_none())
            .filter(|item| {
                item.parent_id()
                    .map(|parent| connection.folder_ids.iter().any(|f| f == parent))
                    .unwrap_or(false)
            })
            .take(options.provider_page_size(MAX_PAGE_SIZE))
            .map(|item| {
                item.into_provider_file().into_meta(
                    &connection.id,
                    self.meta.renewal_period,
                    &self.meta.thresholds,
                    now,
                )
            })
            .collect())
    }

    async fn fetch_bytes(
        &self,
        connection: &StorageConnection,
        access_token: &str,
        file_id: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        // `/content` answers with a redirect to a pre-authenticated download URL.
        let url = self.drive_url(&["items", file_id, "content"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error("graph download", e))?;
        if !response.status().is_success() {
            return Err(api_status_error(response.status(), "graph download"));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error("graph download", e))?;

        tracing::debug!(
            connection_id = %connection.id,
            file_id,
            bytes = bytes.len(),
            "Fetched graph item"
        );
        Ok(bytes.to_vec())
    }

    async fn open_upload_session(
        &self,
        connection: &StorageConnection,
        access_token: &str,
        target: &UploadTarget,
    ) -> Result<Box<dyn UploadSession>, GatewayError> {
        let folder_segment = format!("{}:", target.folder_id);
        let name_segment = format!("{}:", target.file_name);
        let url = self.drive_url(&["items", &folder_segment, &name_segment, "createUploadSession"])?;

        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(&json!({
                "item": {
                    "@microsoft.graph.conflictBehavior": "rename",
                    "name": target.file_name,
                }
            }))
            .send()
            .await
            .map_err(|e| transport_error("graph upload session", e))?;
        if !response.status().is_success() {
            return Err(api_status_error(response.status(), "graph upload session"));
        }
        let session: UploadSessionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::UploadFailed(format!("graph upload session: {}", e)))?;

        Ok(Box::new(GraphUploadSession {
            http: self.upload_http.clone(),
            upload_url: session.upload_url,
            connection_id: connection.id.clone(),
        }))
    }
}

// =============================================================================
// UPLOAD SESSION
// =============================================================================

struct GraphUploadSession {
    http: Client,
    upload_url: String,
    connection_id: String,
}

#[async_trait]
impl UploadSession for GraphUploadSession {
    async fn put_chunk(
        &self,
        range: ChunkRange,
        chunk: &[u8],
    ) -> Result<ChunkOutcome, GatewayError> {
        let response = self
            .http
            .put(&self.upload_url)
            .header(CONTENT_RANGE, range.content_range())
            .header(CONTENT_LENGTH, chunk.len())
            .body(chunk.to_vec())
            .send()
            .await
            .map_err(|e| transport_error("graph chunk", e))?;

        match response.status() {
            StatusCode::ACCEPTED => Ok(ChunkOutcome::Incomplete),
            StatusCode::OK | StatusCode::CREATED => {
                let item: DriveItem = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::UploadFailed(format!("graph final chunk: {}", e)))?;
                Ok(ChunkOutcome::Complete(item.into_pointer(&self.connection_id)))
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(GatewayError::UploadFailed(
                "graph upload session expired".to_string(),
            )),
            status => Err(api_status_error(status, "graph chunk")),
        }
    }

    async fn cancel(&self) -> Result<(), GatewayError> {
        self.http
            .delete(&self.upload_url)
            .send()
            .await
            .map_err(|e| transport_error("graph cancel", e))?;
        Ok(())
    }
}
