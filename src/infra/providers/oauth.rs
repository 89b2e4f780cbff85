// =============================================================================
// OAUTH2 AUTHORIZATION-CODE CLIENT
// =============================================================================
//
// Shared by both provider adapters: builds consent URLs and talks to a token
// endpoint for the authorization-code and refresh-token grants.
//
// **Error mapping:**
// - Network failure, 429 or 5xx -> `ProviderUnavailable`
// - Any other rejection (invalid_grant, revoked consent, bad client) -> `AuthExpired`
//
// Token values never appear in logs or errors.

use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

use crate::core::storage::{GatewayError, TokenGrant};

/// Registered OAuth app plus the provider's endpoints.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    /// Provider-specific consent parameters (e.g. `access_type=offline`).
    pub extra_authorize_params: Vec<(String, String)>,
    /// Whether the refresh grant must repeat the scopes.
    pub scope_on_refresh: bool,
}

/// Raw token endpoint response.
#[derive(Debug, Deserialize)]
pub struct TokenEndpointResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub id_token: Option<String>,
}

impl TokenEndpointResponse {
    /// Providers that omit `expires_in` issue one-hour tokens.
    pub fn into_grant(self, tenant_id: Option<String>) -> TokenGrant {
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_in_secs: self.expires_in.unwrap_or(3600),
            scope: self.scope,
            tenant_id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenEndpointError {
    error: Option<String>,
    error_description: Option<String>,
}

pub struct OAuthClient {
    http: Client,
    config: OAuthClientConfig,
}

impl OAuthClient {
    pub fn new(http: Client, config: OAuthClientConfig) -> Self {
        Self { http, config }
    }

    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, GatewayError> {
        let scope = self.config.scopes.join(" ");
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", self.config.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
            ("state", state),
        ];
        params.extend(
            self.config
                .extra_authorize_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );

        Url::parse_with_params(&self.config.authorize_url, &params)
            .map(|url| url.to_string())
            .map_err(|e| GatewayError::InvalidRequest(format!("bad authorize URL: {}", e)))
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenEndpointResponse, GatewayError> {
        let scope = self.config.scopes.join(" ");
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", scope.as_str()),
        ])
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenEndpointResponse, GatewayError> {
        let scope = self.config.scopes.join(" ");
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        if self.config.scope_on_refresh {
            form.push(("scope", scope.as_str()));
        }
        self.token_request(&form).await
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
    ) -> Result<TokenEndpointResponse, GatewayError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(format!("token endpoint: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| {
                GatewayError::ProviderUnavailable(format!("unreadable token response: {}", e))
            });
        }

        let body: TokenEndpointError = response.json().await.unwrap_or_default();
        let reason = match (body.error, body.error_description) {
            (Some(code), Some(desc)) => format!("{}: {}", code, desc),
            (Some(code), None) => code,
            _ => status.to_string(),
        };
        tracing::warn!(status = %status, "Token endpoint rejected grant");

        if is_transient(status) {
            Err(GatewayError::ProviderUnavailable(reason))
        } else {
            Err(GatewayError::AuthExpired(reason))
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Maps a failed provider API response to the gateway taxonomy.
pub fn api_status_error(status: StatusCode, context: &str) -> GatewayError {
    match status {
        StatusCode::UNAUTHORIZED => GatewayError::AuthExpired(format!("{}: {}", context, status)),
        s if is_transient(s) => GatewayError::ProviderUnavailable(format!("{}: {}", context, s)),
        StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST => {
            GatewayError::InvalidRequest(format!("{}: {}", context, status))
        }
        s => GatewayError::ProviderUnavailable(format!("{}: {}", context, s)),
    }
}

/// Network-level failure of a provider API call.
pub fn transport_error(context: &str, err: reqwest::Error) -> GatewayError {
    GatewayError::ProviderUnavailable(format!("{}: {}", context, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OAuthClient {
        OAuthClient::new(
            Client::new(),
            OAuthClientConfig {
                client_id: "client-1".to_string(),
                client_secret: "secret".to_string(),
                authorize_url: "https://auth.example/authorize".to_string(),
                token_url: "https://auth.example/token".to_string(),
                scopes: vec!["files".to_string(), "offline".to_string()],
                extra_authorize_params: vec![("prompt".to_string(), "consent".to_string())],
                scope_on_refresh: false,
            },
        )
    }

    #[test]
    fn test_authorization_url_carries_state_and_params() {
        let url = client()
            .authorization_url("https://app/cb", "nonce-1")
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let params: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert!(params.contains(&("state".to_string(), "nonce-1".to_string())));
        assert!(params.contains(&("redirect_uri".to_string(), "https://app/cb".to_string())));
        assert!(params.contains(&("scope".to_string(), "files offline".to_string())));
        assert!(params.contains(&("prompt".to_string(), "consent".to_string())));
        assert!(!url.contains("secret"));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            api_status_error(StatusCode::UNAUTHORIZED, "search"),
            GatewayError::AuthExpired(_)
        ));
        assert!(matches!(
            api_status_error(StatusCode::SERVICE_UNAVAILABLE, "search"),
            GatewayError::ProviderUnavailable(_)
        ));
        assert!(matches!(
            api_status_error(StatusCode::TOO_MANY_REQUESTS, "search"),
            GatewayError::ProviderUnavailable(_)
        ));
        assert!(matches!(
            api_status_error(StatusCode::NOT_FOUND, "fetch"),
            GatewayError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_missing_expiry_defaults_to_an_hour() {
        let grant = TokenEndpointResponse {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_in: None,
            scope: None,
            id_token: None,
        }
        .into_grant(None);
        assert_eq!(grant.expires_in_secs, 3600);
    }
}
