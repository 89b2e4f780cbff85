// =============================================================================
// GOOGLE DRIVE ADAPTER (drive-service)
// =============================================================================
//
// Implements `ProviderAdapter` against Drive v3 with per-user OAuth tokens.
//
// **Endpoints used:**
// - `GET  /drive/v3/files?q=...`                      search (metadata only)
// - `GET  /drive/v3/files/{id}?alt=media`             download
// - `GET  /drive/v3/files/{id}/export?mimeType=...`   download native Google Docs
// - `POST /upload/drive/v3/files?uploadType=resumable` open an upload session
//
// Upload sessions answer `308 Resume Incomplete` for every chunk but the last,
// and the last one answers with the created file resource.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION};
use reqwest::{Client, StatusCode};
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

pub const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com";

const SCOPE_DRIVE: &str = "https://www.googleapis.com/auth/drive";
const SCOPE_DRIVE_READONLY: &str = "https://www.googleapis.com/auth/drive.readonly";
const SCOPE_DRIVE_FILE: &str = "https://www.googleapis.com/auth/drive.file";

const NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps.";
const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,webViewLink,parents,permissionIds,version,driveId";

/// Drive's hard limit for `pageSize`.
const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct GoogleDriveSettings {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub api_base: String,
}

impl GoogleDriveSettings {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authorize_url: GOOGLE_AUTHORIZE_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            api_base: DRIVE_API_BASE.to_string(),
        }
    }
}

// =============================================================================
// DRIVE API RESPONSE STRUCTURES
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    modified_time: Option<String>,
    web_view_link: Option<String>,
    #[serde(default)]
    permission_ids: Vec<String>,
    #[serde(default)]
    parents: Vec<String>,
    version: Option<String>,
    drive_id: Option<String>,
}

impl DriveFile {
    fn web_url(&self) -> String {
        self.web_view_link
            .clone()
            .unwrap_or_else(|| format!("https://drive.google.com/file/d/{}/view", self.id))
    }

    /// `/<folder name>` of the first parent we know a name for.
    fn folder_path(&self, folder_names: &HashMap<String, String>) -> Option<String> {
        self.parents
            .iter()
            .find_map(|parent| folder_names.get(parent))
            .map(|name| format!("/{}", name))
    }

    fn into_provider_file(self, folder_names: &HashMap<String, String>) -> ProviderFile {
        ProviderFile {
            folder_path: self.folder_path(folder_names),
            provider: Provider::DriveService,
            drive_id: self.drive_id.clone().unwrap_or_else(|| "my-drive".to_string()),
            web_url: self.web_url(),
            last_modified: parse_timestamp(self.modified_time.as_deref()),
            file_id: self.id,
            name: self.name,
            mime: self.mime_type,
            version: self.version,
            permission_ids: self.permission_ids,
        }
    }

    fn into_pointer(self, connection_id: &str) -> StoragePointer {
        StoragePointer {
            provider: Provider::DriveService,
            drive_id: self.drive_id.clone().unwrap_or_else(|| "my-drive".to_string()),
            web_url: self.web_url(),
            acl_hash: acl_hash(connection_id, &self.id, &self.permission_ids),
            file_id: self.id,
            path: None,
            version: self.version,
        }
    }
}

// =============================================================================
// ADAPTER
// =============================================================================

pub struct GoogleDriveAdapter {
    http: Client,
    upload_http: Client,
    oauth: OAuthClient,
    api_base: String,
    meta: MetaSettings,
}

impl GoogleDriveAdapter {
    pub fn new(settings: GoogleDriveSettings, meta: MetaSettings) -> Result<Self, GatewayError> {
        let (http, upload_http) = build_clients()?;
        let oauth = OAuthClient::new(
            http.clone(),
            OAuthClientConfig {
                client_id: settings.client_id,
                client_secret: settings.client_secret,
                authorize_url: settings.authorize_url,
                token_url: settings.token_url,
                scopes: vec![SCOPE_DRIVE.to_string()],
                // Without offline access + consent Google issues no refresh token.
                extra_authorize_params: vec![
                    ("access_type".to_string(), "offline".to_string()),
                    ("prompt".to_string(), "consent".to_string()),
                    ("include_granted_scopes".to_string(), "true".to_string()),
                ],
                scope_on_refresh: false,
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

    async fn file_mime(&self, access_token: &str, file_id: &str) -> Result<String, GatewayError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct MimeOnly {
            mime_type: String,
        }

        let response = self
            .http
            .get(format!("{}/drive/v3/files/{}", self.api_base, file_id))
            .bearer_auth(access_token)
            .query(&[("fields", "mimeType"), ("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|e| transport_error("drive metadata", e))?;
        if !response.status().is_success() {
            return Err(api_status_error(response.status(), "drive metadata"));
        }
        let meta: MimeOnly = response
            .json()
            .await
            .map_err(|e| transport_error("drive metadata", e))?;
        Ok(meta.mime_type)
    }

    /// Names of the authorized folders, looked up for this call only.
    ///
    /// A folder we cannot read just contributes no path tokens.
    async fn folder_names(
        &self,
        access_token: &str,
        folder_ids: &[String],
    ) -> HashMap<String, String> {
        #[derive(Deserialize)]
        struct NameOnly {
            name: String,
        }

        let mut names = HashMap::new();
        for folder_id in folder_ids {
            let response = self
                .http
                .get(format!("{}/drive/v3/files/{}", self.api_base, folder_id))
                .bearer_auth(access_token)
                .query(&[("fields", "name"), ("supportsAllDrives", "true")])
                .send()
                .await;

            let name = match response {
                Ok(r) if r.status().is_success() => r.json::<NameOnly>().await.ok(),
                Ok(r) => {
                    tracing::debug!(
                        folder_id = %folder_id,
                        status = %r.status(),
                        "Folder name lookup failed"
                    );
                    None
                }
                Err(e) => {
                    tracing::debug!(folder_id = %folder_id, "Folder name lookup failed: {}", e);
                    None
                }
            };
            if let Some(folder) = name {
                names.insert(folder_id.clone(), folder.name);
            }
        }
        names
    }
}

/// Builds the Drive `q` expression: text match, authorized folders, not trashed.
fn search_expression(query: &str, folder_ids: &[String]) -> String {
    let query = escape_query_literal(query);
    let folders = folder_ids
        .iter()
        .map(|f| format!("'{}' in parents", escape_query_literal(f)))
        .collect::<Vec<_>>()
        .join(" or ");
    format!(
        "(name contains '{q}' or fullText contains '{q}') and ({folders}) and trashed = false",
        q = query,
        folders = folders
    )
}

fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn permissions_from_scope(scope: Option<&str>) -> ConnectionPermissions {
    let Some(scope) = scope else {
        return ConnectionPermissions::default();
    };
    let granted: Vec<&str> = scope.split_whitespace().collect();
    let full = granted.contains(&SCOPE_DRIVE);
    let read = full || granted.contains(&SCOPE_DRIVE_READONLY);

    ConnectionPermissions {
        read,
        write: full || granted.contains(&SCOPE_DRIVE_FILE),
        search: read,
    }
}

#[async_trait]
impl ProviderAdapter for GoogleDriveAdapter {
    fn provider(&self) -> Provider {
        Provider::DriveService
    }

    fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, GatewayError> {
        self.oauth.authorization_url(redirect_uri, state)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, GatewayError> {
        Ok(self.oauth.exchange_code(code, redirect_uri).await?.into_grant(None))
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, GatewayError> {
        Ok(self.oauth.refresh(refresh_token).await?.into_grant(None))
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
        let q = search_expression(query, &connection.folder_ids);
        let page_size = options.provider_page_size(MAX_PAGE_SIZE).to_string();
        let fields = format!("files({})", FILE_FIELDS);

        let response = self
            .http
            .get(format!("{}/drive/v3/files", self.api_base))
            .bearer_auth(access_token)
            .query(&[
                ("q", q.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", page_size.as_str()),
                ("orderBy", "modifiedTime desc"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await
            .map_err(|e| transport_error("drive search", e))?;

        if !response.status().is_success() {
            return Err(api_status_error(response.status(), "drive search"));
        }
        let list: DriveFileList = response
            .json()
            .await
            .map_err(|e| transport_error("drive search", e))?;

        let folder_names = self.folder_names(access_token, &connection.folder_ids).await;

        let now = Utc::now();
        Ok(list
            .files
            .into_iter()
            .map(|f| {
                f.into_provider_file(&folder_names).into_meta(
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
        let mime = self.file_mime(access_token, file_id).await?;

        let request = if mime.starts_with(NATIVE_MIME_PREFIX) {
            self.http
                .get(format!("{}/drive/v3/files/{}/export", self.api_base, file_id))
                .query(&[("mimeType", DOCX_MIME)])
        } else {
            self.http
                .get(format!("{}/drive/v3/files/{}", self.api_base, file_id))
                .query(&[("alt", "media"), ("supportsAllDrives", "true")])
        };

        let response = request
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error("drive download", e))?;
        if !response.status().is_success() {
            return Err(api_status_error(response.status(), "drive download"));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error("drive download", e))?;

        tracing::debug!(
            connection_id = %connection.id,
            file_id,
            bytes = bytes.len(),
            "Fetched drive file"
        );
        Ok(bytes.to_vec())
    }

    async fn open_upload_session(
        &self,
        connection: &StorageConnection,
        access_token: &str,
        target: &UploadTarget,
    ) -> Result<Box<dyn UploadSession>, GatewayError> {
        let response = self
            .http
            .post(format!("{}/upload/drive/v3/files", self.api_base))
            .bearer_auth(access_token)
            .query(&[
                ("uploadType", "resumable"),
                ("supportsAllDrives", "true"),
                ("fields", FILE_FIELDS),
            ])
            .header("X-Upload-Content-Type", target.mime.as_str())
            .header("X-Upload-Content-Length", target.byte_length.to_string())
            .json(&json!({
                "name": target.file_name,
                "parents": [target.folder_id],
                "mimeType": target.mime,
            }))
            .send()
            .await
            .map_err(|e| transport_error("drive upload session", e))?;

        if !response.status().is_success() {
            return Err(api_status_error(response.status(), "drive upload session"));
        }
        let session_url = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::UploadFailed("drive did not return a session URI".to_string())
            })?;

        Ok(Box::new(DriveUploadSession {
            http: self.upload_http.clone(),
            session_url,
            access_token: access_token.to_string(),
            connection_id: connection.id.clone(),
        }))
    }
}

// =============================================================================
// UPLOAD SESSION
// =============================================================================

struct DriveUploadSession {
    http: Client,
    session_url: String,
    access_token: String,
    connection_id: String,
}

#[async_trait]
impl UploadSession for DriveUploadSession {
    async fn put_chunk(
        &self,
        range: ChunkRange,
        chunk: &[u8],
    ) -> Result<ChunkOutcome, GatewayError> {
        let response = self
            .http
            .put(&self.session_url)
            .bearer_auth(&self.access_token)
            .header(CONTENT_RANGE, range.content_range())
            .header(CONTENT_LENGTH, chunk.len())
            .body(chunk.to_vec())
            .send()
            .await
            .map_err(|e| transport_error("drive chunk", e))?;

        match response.status() {
            StatusCode::PERMANENT_REDIRECT => Ok(ChunkOutcome::Incomplete),
            StatusCode::OK | StatusCode::CREATED => {
                let file: DriveFile = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::UploadFailed(format!("drive final chunk: {}", e)))?;
                Ok(ChunkOutcome::Complete(file.into_pointer(&self.connection_id)))
            }
            // The session is gone; retrying the chunk cannot help.
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(GatewayError::UploadFailed(
                "drive upload session expired".to_string(),
            )),
            status => Err(api_status_error(status, "drive chunk")),
        }
    }

    async fn cancel(&self) -> Result<(), GatewayError> {
        // Drive acknowledges a cancelled session with 499.
        self.http
            .delete(&self.session_url)
            .bearer_auth(&self.access_token)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| transport_error("drive cancel", e))?;
        Ok(())
    }
}
