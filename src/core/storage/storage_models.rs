// Shared value types for the storage gateway.
// None of these carry document content: only identifiers, dates and
// classification tags. That is what lets them be persisted or logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::storage_error::GatewayError;

// ============================================================================
// PROVIDERS
// ============================================================================

/// The closed set of storage providers the gateway can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// Consumer drive service (Google Drive).
    DriveService,
    /// Enterprise workspace platform (Microsoft Graph / SharePoint).
    WorkspacePlatform,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::DriveService => "drive-service",
            Provider::WorkspacePlatform => "workspace-platform",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drive-service" => Ok(Provider::DriveService),
            "workspace-platform" => Ok(Provider::WorkspacePlatform),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown provider '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// CONNECTIONS
// ============================================================================

/// OAuth2 credentials for one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at_epoch_ms: i64,
}

impl OAuthTokens {
    /// True when the access token is still usable `skew` from now.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        now.timestamp_millis() < self.expires_at_epoch_ms - skew.num_milliseconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPermissions {
    pub read: bool,
    pub write: bool,
    pub search: bool,
}

impl Default for ConnectionPermissions {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            search: true,
        }
    }
}

/// One authorized link between a user and a provider.
///
/// **Invariants:**
/// - `oauth_tokens.refresh_token` is never empty once stored.
/// - `folder_ids` is never empty; search is scoped to these folders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConnection {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    /// Only set for the workspace platform.
    pub tenant_id: Option<String>,
    pub folder_ids: Vec<String>,
    pub template_folder_id: Option<String>,
    pub oauth_tokens: OAuthTokens,
    pub permissions: ConnectionPermissions,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl StorageConnection {
    /// Whether `folder_id` is one the user authorized (including the template folder).
    pub fn can_write_to(&self, folder_id: &str) -> bool {
        self.folder_ids.iter().any(|f| f == folder_id)
            || self.template_folder_id.as_deref() == Some(folder_id)
    }
}

// ============================================================================
// POINTERS AND SEARCH RESULTS
// ============================================================================

/// Opaque reference to a provider-resident file. Never mutated; a changed
/// identity or ACL produces a new pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePointer {
    pub provider: Provider,
    pub drive_id: String,
    pub file_id: String,
    pub web_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Correlation key over the observed permission set. Not a security control.
    pub acl_hash: String,
}

/// Business-domain tags, declared in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Domain {
    #[serde(rename = "HR")]
    Hr,
    Legal,
    Finance,
    #[serde(rename = "IT")]
    It,
    Sales,
    Ops,
    Compliance,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Hr => "HR",
            Domain::Legal => "Legal",
            Domain::Finance => "Finance",
            Domain::It => "IT",
            Domain::Sales => "Sales",
            Domain::Ops => "Ops",
            Domain::Compliance => "Compliance",
        }
    }
}

impl FromStr for Domain {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hr" => Ok(Domain::Hr),
            "legal" => Ok(Domain::Legal),
            "finance" => Ok(Domain::Finance),
            "it" => Ok(Domain::It),
            "sales" => Ok(Domain::Sales),
            "ops" => Ok(Domain::Ops),
            "compliance" => Ok(Domain::Compliance),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown domain '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Policy,
    Process,
    Runbook,
    Template,
    Record,
    Certificate,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Policy => "policy",
            DocType::Process => "process",
            DocType::Runbook => "runbook",
            DocType::Template => "template",
            DocType::Record => "record",
            DocType::Certificate => "certificate",
        }
    }
}

impl FromStr for DocType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "policy" => Ok(DocType::Policy),
            "process" => Ok(DocType::Process),
            "runbook" => Ok(DocType::Runbook),
            "template" => Ok(DocType::Template),
            "record" => Ok(DocType::Record),
            "certificate" => Ok(DocType::Certificate),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown document type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Active,
    Expired,
    PendingRenewal,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Active => "active",
            ComplianceStatus::Expired => "expired",
            ComplianceStatus::PendingRenewal => "pending_renewal",
        }
    }
}

impl FromStr for ComplianceStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ComplianceStatus::Active),
            "expired" => Ok(ComplianceStatus::Expired),
            "pending_renewal" => Ok(ComplianceStatus::PendingRenewal),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown compliance status '{}'",
                other
            ))),
        }
    }
}

/// A normalized search/classification result. Rebuilt on every search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeDocumentMeta {
    pub pointer: StoragePointer,
    pub title: String,
    pub mime: String,
    pub domain: Vec<Domain>,
    pub doc_type: DocType,
    pub last_modified: DateTime<Utc>,
    pub taxonomy: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_date: Option<DateTime<Utc>>,
    pub compliance_status: ComplianceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_provider_round_trips_through_str() {
        assert_eq!(
            "drive-service".parse::<Provider>().unwrap(),
            Provider::DriveService
        );
        assert_eq!(Provider::WorkspacePlatform.as_str(), "workspace-platform");
        assert!("dropbox".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_serializes_kebab_case() {
        let json = serde_json::to_string(&Provider::DriveService).unwrap();
        assert_eq!(json, "\"drive-service\"");
    }

    #[test]
    fn test_domain_serializes_as_tag() {
        let json = serde_json::to_string(&vec![Domain::Hr, Domain::It]).unwrap();
        assert_eq!(json, "[\"HR\",\"IT\"]");
        assert_eq!("hr".parse::<Domain>().unwrap(), Domain::Hr);
    }

    #[test]
    fn test_tokens_freshness_respects_skew() {
        let now = Utc::now();
        let tokens = OAuthTokens {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at_epoch_ms: (now + Duration::seconds(90)).timestamp_millis(),
        };

        assert!(tokens.is_fresh(now, Duration::seconds(60)));
        assert!(!tokens.is_fresh(now, Duration::seconds(120)));
    }
}
