// Compliance Tracker: derives renewal/expiry state from document metadata and
// keeps an append-only history of every observation.
//
// Only metadata flows through here. Callers that track as a side effect of a
// search treat failures as best-effort and just log them.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::compliance_models::{AuditEntry, ComplianceRecord, ComplianceRules};
use crate::core::storage::classification::classify_with_path;
use crate::core::storage::{
    compliance_status, ComplianceThresholds, GatewayError, KnowledgeDocumentMeta,
};

pub const TRACKED_ACTION: &str = "tracked";

/// Longest renewal period a caller may ask for, roughly a century.
pub const MAX_RENEWAL_DAYS: i64 = 36_500;

/// Persistence port for compliance records.
#[async_trait]
pub trait ComplianceStore: Send + Sync {
    /// Creates the record for (connection, document) if missing, otherwise
    /// supersedes its observed fields. Then appends `entry` to its trail.
    /// The record's own `id` and `audit_trail` are ignored when it exists.
    async fn append_observation(
        &self,
        record: &ComplianceRecord,
        entry: &AuditEntry,
    ) -> Result<(), GatewayError>;

    async fn get_record(
        &self,
        connection_id: &str,
        document_id: &str,
    ) -> Result<Option<ComplianceRecord>, GatewayError>;

    async fn list_records(&self, connection_id: &str)
        -> Result<Vec<ComplianceRecord>, GatewayError>;
}

pub struct ComplianceTracker {
    store: Arc<dyn ComplianceStore>,
    thresholds: ComplianceThresholds,
    default_renewal_days: i64,
}

impl ComplianceTracker {
    pub fn new(
        store: Arc<dyn ComplianceStore>,
        thresholds: ComplianceThresholds,
        default_renewal_days: i64,
    ) -> Self {
        Self {
            store,
            thresholds,
            default_renewal_days,
        }
    }

    /// Records one compliance observation of `meta`.
    ///
    /// Classification is recomputed from the title, mime type and path, so the
    /// record does not depend on tags a caller supplied.
    pub async fn track_compliance_document(
        &self,
        connection_id: &str,
        meta: &KnowledgeDocumentMeta,
        rules: &ComplianceRules,
    ) -> Result<(), GatewayError> {
        let renewal_days = rules.renewal_period_days.unwrap_or(self.default_renewal_days);
        if renewal_days <= 0 {
            return Err(GatewayError::InvalidRequest(
                "renewal period must be at least one day".to_string(),
            ));
        }
        if renewal_days > MAX_RENEWAL_DAYS {
            return Err(GatewayError::InvalidRequest(format!(
                "renewal period must be at most {MAX_RENEWAL_DAYS} days"
            )));
        }

        let now = Utc::now();
        let hints = classify_with_path(&meta.title, &meta.mime, meta.pointer.path.as_deref());
        let renewal_date = Duration::try_days(renewal_days)
            .and_then(|period| meta.last_modified.checked_add_signed(period))
            .ok_or_else(|| {
                GatewayError::InvalidRequest("renewal date is out of range".to_string())
            })?;
        let status = compliance_status(meta.last_modified, now, &self.thresholds);

        let record = ComplianceRecord {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            document_id: meta.pointer.file_id.clone(),
            title: meta.title.clone(),
            domain: hints.domain,
            doc_type: hints.doc_type,
            last_modified: meta.last_modified,
            renewal_date,
            compliance_status: status,
            taxonomy: hints.taxonomy,
            audit_trail: Vec::new(),
        };

        let entry = AuditEntry {
            action: TRACKED_ACTION.to_string(),
            timestamp: now,
            metadata: json!({
                "provider": meta.pointer.provider,
                "aclHash": meta.pointer.acl_hash,
                "version": meta.pointer.version,
                "lastModified": record.last_modified,
                "renewalDate": record.renewal_date,
                "complianceStatus": record.compliance_status,
                "domain": record.domain,
                "docType": record.doc_type,
                "taxonomy": record.taxonomy,
            }),
        };

        self.store.append_observation(&record, &entry).await?;

        tracing::info!(
            connection_id,
            document_id = %record.document_id,
            status = record.compliance_status.as_str(),
            "Tracked compliance document"
        );

        Ok(())
    }

    pub async fn get_record(
        &self,
        connection_id: &str,
        document_id: &str,
    ) -> Result<Option<ComplianceRecord>, GatewayError> {
        let now = Utc::now();
        Ok(self
            .store
            .get_record(connection_id, document_id)
            .await?
            .map(|r| r.with_current_status(now, &self.thresholds)))
    }

    pub async fn list_records(
        &self,
        connection_id: &str,
    ) -> Result<Vec<ComplianceRecord>, GatewayError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_records(connection_id)
            .await?
            .into_iter()
            .map(|r| r.with_current_status(now, &self.thresholds))
            .collect())
    }
}
