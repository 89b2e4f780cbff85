// Heuristic classification of provider files.
//
// Everything here is a pure function of names, mime types and dates. Adapters
// call it while normalizing search hits, and the compliance tracker calls it to
// reclassify without going back to the provider.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::storage_models::{
    ComplianceStatus, DocType, Domain, KnowledgeDocumentMeta, Provider, StoragePointer,
};

/// Keywords per domain, in priority order. The first matching entry is the
/// primary domain; documents matching nothing land in `Compliance`.
const DOMAIN_KEYWORDS: &[(Domain, &[&str])] = &[
    (
        Domain::Hr,
        &[
            "hr", "human resources", "onboarding", "offboarding", "employee", "payroll",
            "benefits", "recruit", "hiring", "handbook", "leave",
        ],
    ),
    (
        Domain::Legal,
        &[
            "legal", "contract", "nda", "agreement", "gdpr", "terms", "privacy", "litigation",
        ],
    ),
    (
        Domain::Finance,
        &[
            "finance", "invoice", "budget", "expense", "tax", "accounting", "payment", "revenue",
        ],
    ),
    (
        Domain::It,
        &[
            "it", "security", "iso27001", "infrastructure", "network", "backup", "password",
            "devops", "server",
        ],
    ),
    (
        Domain::Sales,
        &["sales", "pricing", "proposal", "quote", "customer", "crm", "deal"],
    ),
    (
        Domain::Ops,
        &[
            "ops", "operations", "logistics", "facility", "supply", "vendor", "maintenance",
        ],
    ),
];

/// Document type keywords, checked in order; the first hit wins.
const DOC_TYPE_KEYWORDS: &[(DocType, &[&str])] = &[
    (DocType::Template, &["template"]),
    (DocType::Policy, &["policy", "policies"]),
    (DocType::Runbook, &["runbook", "playbook"]),
    (DocType::Process, &["process", "procedure", "sop", "workflow"]),
    (DocType::Certificate, &["certificate", "certification", "cert", "license"]),
];

const TAXONOMY_KEYWORDS: &[&str] = &[
    "iso27001", "iso9001", "soc2", "gdpr", "hipaa", "pci", "sox", "onboarding", "renewal",
    "audit", "training", "retention",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationHints {
    pub domain: Vec<Domain>,
    pub doc_type: DocType,
    pub taxonomy: Vec<String>,
}

/// Day thresholds for the compliance state derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplianceThresholds {
    /// Strictly more days than this is `pending_renewal`.
    pub pending_renewal_days: i64,
    /// Strictly more days than this is `expired`.
    pub expiry_days: i64,
}

impl Default for ComplianceThresholds {
    fn default() -> Self {
        Self {
            pending_renewal_days: 300,
            expiry_days: 365,
        }
    }
}

/// Lowercased name, path and mime type; keywords match anywhere inside it.
struct Haystack(String);

impl Haystack {
    fn new(parts: &[&str]) -> Self {
        Self(parts.join(" ").to_lowercase())
    }

    fn matches(&self, keyword: &str) -> bool {
        self.0.contains(keyword)
    }

    fn matches_any(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.matches(k))
    }
}

/// Classifies a file from its name and mime type alone.
pub fn classify_hints(file_name: &str, mime: &str) -> ClassificationHints {
    classify_with_path(file_name, mime, None)
}

/// Like [`classify_hints`], but folder path tokens also count.
pub fn classify_with_path(
    file_name: &str,
    mime: &str,
    folder_path: Option<&str>,
) -> ClassificationHints {
    let haystack = Haystack::new(&[file_name, folder_path.unwrap_or(""), mime]);

    let mut domain: Vec<Domain> = DOMAIN_KEYWORDS
        .iter()
        .filter(|(_, keywords)| haystack.matches_any(keywords))
        .map(|(d, _)| *d)
        .collect();
    if domain.is_empty() {
        domain.push(Domain::Compliance);
    }

    let doc_type = DOC_TYPE_KEYWORDS
        .iter()
        .find(|(_, keywords)| haystack.matches_any(keywords))
        .map(|(t, _)| *t)
        .unwrap_or(DocType::Record);

    let taxonomy = TAXONOMY_KEYWORDS
        .iter()
        .filter(|k| haystack.matches(k))
        .map(|k| k.to_string())
        .collect();

    ClassificationHints {
        domain,
        doc_type,
        taxonomy,
    }
}

/// Derives the compliance state from the age of a document.
///
/// Recomputed on every read; never stored as a flag that could drift.
pub fn compliance_status(
    last_modified: DateTime<Utc>,
    now: DateTime<Utc>,
    thresholds: &ComplianceThresholds,
) -> ComplianceStatus {
    let age_days = (now - last_modified).num_days();
    if age_days > thresholds.expiry_days {
        ComplianceStatus::Expired
    } else if age_days > thresholds.pending_renewal_days {
        ComplianceStatus::PendingRenewal
    } else {
        ComplianceStatus::Active
    }
}

/// Fingerprint of a file's observed access-control state.
///
/// This is a correlation key for audit trails, not a security control: it is
/// only as precise as the permission identifiers the provider hands back.
pub fn acl_hash(connection_id: &str, file_id: &str, permission_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = permission_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    hasher.update(connection_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(file_id.as_bytes());
    for id in sorted {
        hasher.update([0u8]);
        hasher.update(id.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// A provider search hit before normalization. Adapters fill this in from
/// their native response shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFile {
    pub provider: Provider,
    pub drive_id: String,
    pub file_id: String,
    pub name: String,
    pub mime: String,
    pub web_url: String,
    pub last_modified: DateTime<Utc>,
    pub folder_path: Option<String>,
    pub version: Option<String>,
    pub permission_ids: Vec<String>,
}

impl ProviderFile {
    /// Normalizes the hit into a `KnowledgeDocumentMeta`.
    pub fn into_meta(
        self,
        connection_id: &str,
        renewal_period: Duration,
        thresholds: &ComplianceThresholds,
        now: DateTime<Utc>,
    ) -> KnowledgeDocumentMeta {
        let hints = classify_with_path(&self.name, &self.mime, self.folder_path.as_deref());
        let status = compliance_status(self.last_modified, now, thresholds);

        KnowledgeDocumentMeta {
            pointer: StoragePointer {
                provider: self.provider,
                acl_hash: acl_hash(connection_id, &self.file_id, &self.permission_ids),
                drive_id: self.drive_id,
                file_id: self.file_id,
                web_url: self.web_url,
                path: self.folder_path,
                version: self.version,
            },
            title: self.name,
            mime: self.mime,
            domain: hints.domain,
            doc_type: hints.doc_type,
            last_modified: self.last_modified,
            taxonomy: hints.taxonomy,
            business_entity: None,
            renewal_date: Some(self.last_modified + renewal_period),
            compliance_status: status,
        }
    }
}
