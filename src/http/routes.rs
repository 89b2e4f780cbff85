// ============================================================================
// ROUTES
// ============================================================================
//
// Thin handlers: resolve the caller, check that the connection belongs to
// them, then call exactly one core operation. Responses never include OAuth
// tokens.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ApiError, AppState};
use crate::core::compliance::{ComplianceRecord, ComplianceRules};
use crate::core::connections::{AuthorizationRequest, OAuthCallback};
use crate::core::documents::{DocumentTemplate, GenerationDestination, TemplateFormat};
use crate::core::storage::{
    ConnectionPermissions, Domain, GatewayError, KnowledgeDocumentMeta, Provider, SearchOptions,
    StorageConnection, StoragePointer,
};

pub const USER_ID_HEADER: &str = "x-user-id";

pub fn router(state: AppState) -> Router {
    // The router wants one parameter name per segment position, so the
    // provider segment of the oauth routes is also called `id`.
    Router::new()
        .route("/health", get(health))
        .route("/connections", get(list_connections))
        .route("/connections/{id}/oauth/start", post(start_oauth))
        .route("/connections/{id}/oauth/callback", post(complete_oauth))
        .route("/connections/{id}", axum::routing::delete(disconnect))
        .route("/connections/{id}/folders", put(update_folders))
        .route("/connections/{id}/search", post(search))
        .route("/connections/{id}/generate", post(generate))
        .route(
            "/connections/{id}/compliance",
            post(track_compliance).get(list_compliance),
        )
        .route(
            "/connections/{id}/compliance/{document_id}",
            get(get_compliance),
        )
        .with_state(state)
}

fn caller_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("missing X-User-Id header"))
}

// ============================================================================
// RESPONSE AND REQUEST BODIES
// ============================================================================

/// A connection as callers see it: everything but the tokens.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    pub id: String,
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub folder_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_folder_id: Option<String>,
    pub permissions: ConnectionPermissions,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl From<StorageConnection> for ConnectionView {
    fn from(c: StorageConnection) -> Self {
        Self {
            access_expires_at: DateTime::from_timestamp_millis(c.oauth_tokens.expires_at_epoch_ms),
            id: c.id,
            provider: c.provider,
            tenant_id: c.tenant_id,
            folder_ids: c.folder_ids,
            template_folder_id: c.template_folder_id,
            permissions: c.permissions,
            created_at: c.created_at,
            last_used_at: c.last_used_at,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartOAuthRequest {
    redirect_uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteOAuthRequest {
    state: String,
    code: String,
    redirect_uri: String,
    #[serde(default)]
    selected_folder_ids: Vec<String>,
    template_folder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateFoldersRequest {
    folder_ids: Vec<String>,
    template_folder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    query: String,
    max_docs: Option<usize>,
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    track_compliance: bool,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    documents: Vec<KnowledgeDocumentMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    template_id: String,
    format: String,
    #[serde(default)]
    data: BTreeMap<String, String>,
    destination: GenerationDestination,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackComplianceRequest {
    document: KnowledgeDocumentMeta,
    #[serde(default)]
    rules: ComplianceRules,
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn start_oauth(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(provider): Path<String>,
    Json(body): Json<StartOAuthRequest>,
) -> Result<Json<AuthorizationRequest>, ApiError> {
    let user_id = caller_id(&headers)?;
    let provider: Provider = provider.parse()?;

    let request = state
        .connections
        .initiate_oauth_connection(&user_id, provider, &body.redirect_uri)
        .await?;
    Ok(Json(request))
}

async fn complete_oauth(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(provider): Path<String>,
    Json(body): Json<CompleteOAuthRequest>,
) -> Result<(StatusCode, Json<ConnectionView>), ApiError> {
    let user_id = caller_id(&headers)?;
    let provider: Provider = provider.parse()?;

    let connection = state
        .connections
        .complete_oauth_connection(
            &user_id,
            OAuthCallback {
                provider,
                state: body.state,
                code: body.code,
                redirect_uri: body.redirect_uri,
                selected_folder_ids: body.selected_folder_ids,
                template_folder_id: body.template_folder_id,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(connection.into())))
}

async fn list_connections(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConnectionView>>, ApiError> {
    let user_id = caller_id(&headers)?;
    let connections = state.connections.list_connections(&user_id).await?;
    Ok(Json(connections.into_iter().map(ConnectionView::from).collect()))
}

async fn disconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user_id = caller_id(&headers)?;
    state.connections.disconnect(&user_id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_folders(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateFoldersRequest>,
) -> Result<Json<ConnectionView>, ApiError> {
    let user_id = caller_id(&headers)?;
    let connection = state
        .connections
        .update_folders(
            &user_id,
            &id,
            &body.folder_ids,
            body.template_folder_id.as_deref(),
        )
        .await?;
    Ok(Json(connection.into()))
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let user_id = caller_id(&headers)?;
    state.connections.get_for_user(&user_id, &id).await?;

    let domains = body
        .domains
        .iter()
        .map(|d| d.parse::<Domain>())
        .collect::<Result<Vec<_>, GatewayError>>()?;
    let defaults = SearchOptions::default();
    let options = SearchOptions {
        max_docs: body.max_docs.unwrap_or(defaults.max_docs),
        domains,
        track_compliance: body.track_compliance,
    };

    let documents = state
        .search
        .search_documents(&id, &body.query, &options)
        .await?;
    Ok(Json(SearchResponse { documents }))
}

async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<StoragePointer>), ApiError> {
    let user_id = caller_id(&headers)?;
    state.connections.get_for_user(&user_id, &id).await?;

    let template = DocumentTemplate {
        file_id: body.template_id,
        format: body.format.parse::<TemplateFormat>()?,
    };
    let pointer = state
        .generation
        .generate_document(&id, &template, &body.data, &body.destination)
        .await?;
    Ok((StatusCode::CREATED, Json(pointer)))
}

async fn track_compliance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<TrackComplianceRequest>,
) -> Result<Json<ComplianceRecord>, ApiError> {
    let user_id = caller_id(&headers)?;
    state.connections.get_for_user(&user_id, &id).await?;

    state
        .compliance
        .track_compliance_document(&id, &body.document, &body.rules)
        .await?;
    let record = state
        .compliance
        .get_record(&id, &body.document.pointer.file_id)
        .await?
        .ok_or_else(|| GatewayError::Storage("tracked record not readable".to_string()))?;
    Ok(Json(record))
}

async fn list_compliance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<ComplianceRecord>>, ApiError> {
    let user_id = caller_id(&headers)?;
    state.connections.get_for_user(&user_id, &id).await?;
    Ok(Json(state.compliance.list_records(&id).await?))
}

async fn get_compliance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, document_id)): Path<(String, String)>,
) -> Result<Json<ComplianceRecord>, ApiError> {
    let user_id = caller_id(&headers)?;
    state.connections.get_for_user(&user_id, &id).await?;

    match state.compliance.get_record(&id, &document_id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: "No compliance record for that document.".to_string(),
            retryable: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Duration;
    use std::sync::Arc;

    use crate::core::compliance::ComplianceTracker;
    use crate::core::connections::{ConnectionManager, TokenVault};
    use crate::core::documents::{DocumentSearchGateway, GenerationAuditLog, GenerationPipeline};
    use crate::core::storage::test_support::{FixtureFile, FixtureProvider, VALID_CODE};
    use crate::core::storage::{
        ChunkedUploader, ComplianceThresholds, ProviderAdapter, ProviderRegistry, UploadSettings,
    };
    use crate::infra::storage::{
        InMemoryComplianceStore, InMemoryConnectionStore, InMemoryGenerationAudit,
    };

    struct Harness {
        state: AppState,
        audit: Arc<InMemoryGenerationAudit>,
    }

    fn harness() -> Harness {
        let provider = Arc::new(
            FixtureProvider::new(Provider::DriveService)
                .with_file(FixtureFile::new(
                    "f-1",
                    "HR_Onboarding_Policy.docx",
                    "folderA",
                    b"welcome",
                ))
                .with_file(FixtureFile::new(
                    "tpl-1",
                    "Offer_Template.html",
                    "folderA",
                    b"<p>Dear {{name}}</p>",
                )),
        );
        let mut registry = ProviderRegistry::new();
        registry.register(provider as Arc<dyn ProviderAdapter>);
        let registry = Arc::new(registry);

        let store = Arc::new(InMemoryConnectionStore::new());
        let vault = Arc::new(TokenVault::new(
            store.clone(),
            registry.clone(),
            Duration::seconds(60),
        ));
        let compliance = Arc::new(ComplianceTracker::new(
            Arc::new(InMemoryComplianceStore::new()),
            ComplianceThresholds::default(),
            365,
        ));
        let audit = Arc::new(InMemoryGenerationAudit::new());

        let state = AppState {
            connections: Arc::new(ConnectionManager::new(
                store.clone(),
                registry.clone(),
                vault.clone(),
                Duration::minutes(10),
            )),
            search: Arc::new(
                DocumentSearchGateway::new(store.clone(), registry.clone(), vault.clone())
                    .with_compliance(compliance.clone()),
            ),
            generation: Arc::new(GenerationPipeline::new(
                store,
                registry,
                vault,
                ChunkedUploader::new(UploadSettings::default()),
                audit.clone(),
            )),
            compliance,
        };
        Harness { state, audit }
    }

    fn as_user(user_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_str(user_id).unwrap());
        headers
    }

    async fn connect(state: &AppState, user_id: &str) -> ConnectionView {
        let Json(auth) = start_oauth(
            State(state.clone()),
            as_user(user_id),
            Path("drive-service".to_string()),
            Json(StartOAuthRequest {
                redirect_uri: "https://app/cb".to_string(),
            }),
        )
        .await
        .unwrap();

        let (status, Json(view)) = complete_oauth(
            State(state.clone()),
            as_user(user_id),
            Path("drive-service".to_string()),
            Json(CompleteOAuthRequest {
                state: auth.state,
                code: VALID_CODE.to_string(),
                redirect_uri: "https://app/cb".to_string(),
                selected_folder_ids: vec!["folderA".to_string()],
                template_folder_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        view
    }

    #[tokio::test]
    async fn test_connection_views_never_carry_tokens() {
        let h = harness();
        let view = connect(&h.state, "user-1").await;

        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("access-1"));
        assert!(!json.contains("refresh-1"));
        assert!(view.access_expires_at.is_some());

        let Json(listed) = list_connections(State(h.state.clone()), as_user("user-1"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].folder_ids, vec!["folderA".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_caller_is_rejected() {
        let h = harness();
        let err = list_connections(State(h.state.clone()), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_bad_request() {
        let h = harness();
        let err = start_oauth(
            State(h.state.clone()),
            as_user("user-1"),
            Path("dropbox".to_string()),
            Json(StartOAuthRequest {
                redirect_uri: "https://app/cb".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, "bad_request");
    }

    #[tokio::test]
    async fn test_search_and_track_through_http() {
        let h = harness();
        let view = connect(&h.state, "user-1").await;

        let Json(found) = search(
            State(h.state.clone()),
            as_user("user-1"),
            Path(view.id.clone()),
            Json(SearchRequest {
                query: "onboarding".to_string(),
                max_docs: None,
                domains: vec!["hr".to_string()],
                track_compliance: true,
            }),
        )
        .await
        .unwrap();
        assert_eq!(found.documents.len(), 1);
        assert_eq!(found.documents[0].pointer.file_id, "f-1");

        let Json(records) = list_compliance(
            State(h.state.clone()),
            as_user("user-1"),
            Path(view.id.clone()),
        )
        .await
        .unwrap();
        assert_eq!(records.len(), 1);

        let Json(record) = get_compliance(
            State(h.state.clone()),
            as_user("user-1"),
            Path((view.id.clone(), "f-1".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(record.audit_trail.len(), 1);

        let missing = get_compliance(
            State(h.state.clone()),
            as_user("user-1"),
            Path((view.id.clone(), "nope".to_string())),
        )
        .await
        .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_explicit_tracking_appends_to_trail() {
        let h = harness();
        let view = connect(&h.state, "user-1").await;

        let Json(found) = search(
            State(h.state.clone()),
            as_user("user-1"),
            Path(view.id.clone()),
            Json(SearchRequest {
                query: "policy".to_string(),
                max_docs: Some(5),
                domains: vec![],
                track_compliance: false,
            }),
        )
        .await
        .unwrap();

        for _ in 0..2 {
            track_compliance(
                State(h.state.clone()),
                as_user("user-1"),
                Path(view.id.clone()),
                Json(TrackComplianceRequest {
                    document: found.documents[0].clone(),
                    rules: ComplianceRules {
                        renewal_period_days: Some(30),
                    },
                }),
            )
            .await
            .unwrap();
        }

        let Json(record) = get_compliance(
            State(h.state.clone()),
            as_user("user-1"),
            Path((view.id.clone(), "f-1".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(record.audit_trail.len(), 2);
        assert_eq!(record.renewal_date, record.last_modified + Duration::days(30));
    }

    #[tokio::test]
    async fn test_generate_uploads_and_audits() {
        let h = harness();
        let view = connect(&h.state, "user-1").await;

        let (status, Json(pointer)) = generate(
            State(h.state.clone()),
            as_user("user-1"),
            Path(view.id.clone()),
            Json(GenerateRequest {
                template_id: "tpl-1".to_string(),
                format: "html".to_string(),
                data: BTreeMap::from([("name".to_string(), "Ada".to_string())]),
                destination: GenerationDestination {
                    folder_id: "folderA".to_string(),
                    file_name: "Offer.html".to_string(),
                },
            }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(pointer.file_id, "generated-Offer.html");
        let entries = h.audit.list_for_connection(&view.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field_names, vec!["name".to_string()]);
    }

    #[tokio::test]
    async fn test_unsupported_template_format() {
        let h = harness();
        let view = connect(&h.state, "user-1").await;

        let err = generate(
            State(h.state.clone()),
            as_user("user-1"),
            Path(view.id.clone()),
            Json(GenerateRequest {
                template_id: "tpl-1".to_string(),
                format: "xlsx".to_string(),
                data: BTreeMap::new(),
                destination: GenerationDestination {
                    folder_id: "folderA".to_string(),
                    file_name: "Sheet.xlsx".to_string(),
                },
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_other_users_connections_are_not_found() {
        let h = harness();
        let view = connect(&h.state, "user-1").await;

        let err = disconnect(
            State(h.state.clone()),
            as_user("user-2"),
            Path(view.id.clone()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let status = disconnect(State(h.state.clone()), as_user("user-1"), Path(view.id))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let Json(listed) = list_connections(State(h.state.clone()), as_user("user-1"))
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_update_folders_rejects_empty_selection() {
        let h = harness();
        let view = connect(&h.state, "user-1").await;

        let err = update_folders(
            State(h.state.clone()),
            as_user("user-1"),
            Path(view.id.clone()),
            Json(UpdateFoldersRequest {
                folder_ids: vec![],
                template_folder_id: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let Json(updated) = update_folders(
            State(h.state.clone()),
            as_user("user-1"),
            Path(view.id),
            Json(UpdateFoldersRequest {
                folder_ids: vec!["folderB".to_string()],
                template_folder_id: Some("templates".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.folder_ids, vec!["folderB".to_string()]);
        assert_eq!(updated.template_folder_id.as_deref(), Some("templates"));
    }
}
