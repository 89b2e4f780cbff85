use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================
// One taxonomy for the whole gateway. Variants carry identifiers and provider
// status text only, never document content.

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The refresh grant was rejected; the user has to reconnect.
    #[error("Authorization expired: {0}")]
    AuthExpired(String),

    /// Network failure or 5xx from a provider.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// OAuth state mismatch or replay.
    #[error("Invalid OAuth state: {0}")]
    InvalidState(String),

    /// A chunk upload failed; no pointer was produced.
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Unsupported template format: {0}")]
    UnsupportedFormat(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    /// Whether a caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::ProviderUnavailable(_) | GatewayError::UploadFailed(_)
        )
    }

    /// Text safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::AuthExpired(_) => {
                "Your storage connection has expired. Please reconnect your account.".to_string()
            }
            GatewayError::UnsupportedFormat(format) => format!(
                "Templates in '{}' format are not supported. Use docx, html or pdf.",
                format
            ),
            GatewayError::ProviderUnavailable(_) | GatewayError::UploadFailed(_) => {
                "The storage provider could not complete the request. Please try again.".to_string()
            }
            GatewayError::InvalidState(_) => {
                "The connection attempt is no longer valid. Please start again.".to_string()
            }
            GatewayError::ConnectionNotFound(_) => "That storage connection does not exist.".to_string(),
            GatewayError::ProviderNotConfigured(provider) => {
                format!("The {} provider is not enabled on this server.", provider)
            }
            GatewayError::InvalidRequest(reason) => reason.clone(),
            GatewayError::Storage(_) => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Storage(err.to_string())
    }
}
