use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::storage::{
    compliance_status, ComplianceStatus, ComplianceThresholds, DocType, Domain,
};

/// One observation in a record's history. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: String,
    pub timestamp: DateTime<Utc>,
    /// Identifiers, dates and tags only.
    pub metadata: serde_json::Value,
}

/// Compliance state of one document seen through one connection.
///
/// The observed fields reflect the latest observation; the audit trail keeps
/// every earlier one. Records are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceRecord {
    pub id: String,
    pub connection_id: String,
    pub document_id: String,
    pub title: String,
    pub domain: Vec<Domain>,
    pub doc_type: DocType,
    pub last_modified: DateTime<Utc>,
    pub renewal_date: DateTime<Utc>,
    pub compliance_status: ComplianceStatus,
    pub taxonomy: Vec<String>,
    pub audit_trail: Vec<AuditEntry>,
}

impl ComplianceRecord {
    /// Re-derives the status for `now`; stored statuses are only a snapshot.
    pub fn with_current_status(mut self, now: DateTime<Utc>, thresholds: &ComplianceThresholds) -> Self {
        self.compliance_status = compliance_status(self.last_modified, now, thresholds);
        self
    }
}

/// Caller-supplied tracking rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceRules {
    /// Days from last modification until renewal is due.
    #[serde(default)]
    pub renewal_period_days: Option<i64>,
}
