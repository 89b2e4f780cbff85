// Streaming Generation Pipeline: template bytes in, merged document out, all in
// memory.
//
// **Steps:**
// 1. Fetch the template into a buffer owned by this call.
// 2. Merge the data into a new buffer; the template buffer is consumed.
// 3. Upload the merged buffer in chunks to the destination folder.
// 4. Append one audit entry (pointer, field names, timestamp), only after the
//    upload is confirmed.
//
// No buffer outlives the call and nothing is written to disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::template_merge::{merge_template, TemplateFormat};
use crate::core::connections::{ConnectionStore, TokenVault};
use crate::core::storage::{
    ChunkedUploader, GatewayError, ProviderRegistry, StoragePointer, UploadTarget,
};

/// Attempts at writing the audit entry of a generated document.
const AUDIT_ATTEMPTS: u32 = 3;
const AUDIT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTemplate {
    pub file_id: String,
    pub format: TemplateFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationDestination {
    pub folder_id: String,
    pub file_name: String,
}

/// Record of one generated document. Field values are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationAuditEntry {
    pub connection_id: String,
    pub pointer: StoragePointer,
    pub field_names: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Append-only log of generated documents.
#[async_trait]
pub trait GenerationAuditLog: Send + Sync {
    async fn append(&self, entry: &GenerationAuditEntry) -> Result<(), GatewayError>;

    async fn list_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<GenerationAuditEntry>, GatewayError>;
}

pub struct GenerationPipeline {
    connections: Arc<dyn ConnectionStore>,
    providers: Arc<ProviderRegistry>,
    vault: Arc<TokenVault>,
    uploader: ChunkedUploader,
    audit: Arc<dyn GenerationAuditLog>,
}

impl GenerationPipeline {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        providers: Arc<ProviderRegistry>,
        vault: Arc<TokenVault>,
        uploader: ChunkedUploader,
        audit: Arc<dyn GenerationAuditLog>,
    ) -> Self {
        Self {
            connections,
            providers,
            vault,
            uploader,
            audit,
        }
    }

    /// Merges `data` into `template` and uploads the result to `destination`.
    ///
    /// Either returns the pointer of the uploaded document or fails without
    /// an audit entry.
    pub async fn generate_document(
        &self,
        connection_id: &str,
        template: &DocumentTemplate,
        data: &BTreeMap<String, String>,
        destination: &GenerationDestination,
    ) -> Result<StoragePointer, GatewayError> {
        let file_name = destination.file_name.trim();
        if file_name.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "destination file name must not be empty".to_string(),
            ));
        }

        let connection = self.connections.require(connection_id).await?;
        if !(connection.permissions.read && connection.permissions.write) {
            return Err(GatewayError::InvalidRequest(
                "connection was not granted read and write access".to_string(),
            ));
        }
        if !connection.can_write_to(&destination.folder_id) {
            return Err(GatewayError::InvalidRequest(format!(
                "folder {} is not authorized for this connection",
                destination.folder_id
            )));
        }

        let adapter = self.providers.get(connection.provider)?;
        let token = self.vault.get_valid_access_token(&connection).await?;

        let template_bytes = adapter
            .fetch_bytes(&connection, &token, &template.file_id)
            .await?;
        let merged = merge_template(template.format, template_bytes, data)?;
        if merged.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "merged document is empty".to_string(),
            ));
        }

        tracing::debug!(
            connection_id,
            template_id = %template.file_id,
            format = template.format.as_str(),
            bytes = merged.len(),
            "Merged template"
        );

        let target = UploadTarget {
            folder_id: destination.folder_id.clone(),
            file_name: file_name.to_string(),
            mime: template.format.mime().to_string(),
            byte_length: merged.len() as u64,
        };
        let pointer = self
            .uploader
            .resumable_upload(adapter.as_ref(), &connection, &token, &target, &merged)
            .await?;
        drop(merged);

        let entry = GenerationAuditEntry {
            connection_id: connection_id.to_string(),
            pointer: pointer.clone(),
            field_names: data.keys().cloned().collect(),
            generated_at: Utc::now(),
        };
        // The document exists at this point; without its audit entry the
        // generation counts as failed, and the error names the file.
        if let Err(e) = self.record_generation(&entry).await {
            tracing::error!(
                connection_id,
                file_id = %pointer.file_id,
                "Failed to record generated document: {}",
                e
            );
            return Err(GatewayError::Storage(format!(
                "document {} was uploaded but its audit entry could not be written: {}",
                pointer.file_id, e
            )));
        }

        tracing::info!(
            connection_id,
            file_id = %pointer.file_id,
            fields = ?entry.field_names,
            "Generated document"
        );

        Ok(pointer)
    }

    async fn record_generation(&self, entry: &GenerationAuditEntry) -> Result<(), GatewayError> {
        let mut attempt = 1;
        loop {
            match self.audit.append(entry).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < AUDIT_ATTEMPTS => {
                    tracing::warn!(attempt, "Audit append failed, retrying: {}", e);
                    tokio::time::sleep(AUDIT_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
