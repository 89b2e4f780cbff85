// Provider adapters: one `ProviderAdapter` implementation per storage
// provider, plus the OAuth2 client they share.

pub mod google_drive_client;
pub mod microsoft_graph_client;
pub mod oauth;

pub use google_drive_client::{GoogleDriveAdapter, GoogleDriveSettings};
pub use microsoft_graph_client::{MicrosoftGraphAdapter, MicrosoftGraphSettings};

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;

use crate::core::storage::{ComplianceThresholds, GatewayError};

/// How adapters fill the derived compliance fields of search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaSettings {
    pub renewal_period: Duration,
    pub thresholds: ComplianceThresholds,
}

impl Default for MetaSettings {
    fn default() -> Self {
        Self {
            renewal_period: Duration::days(365),
            thresholds: ComplianceThresholds::default(),
        }
    }
}

/// Parses a provider RFC 3339 timestamp. Unparseable values count as "now"
/// so a malformed date never marks a document expired.
fn parse_timestamp(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Clients for API calls and for upload sessions. Upload sessions must see
/// Drive's `308 Resume Incomplete` instead of following it.
fn build_clients() -> Result<(Client, Client), GatewayError> {
    let api = Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;
    let upload = Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;
    Ok((api, upload))
}
