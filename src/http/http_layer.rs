// HTTP layer - axum routes over the core services.
//
// Callers are identified by the `X-User-Id` header. Sessions and login live
// in front of this service; the id is treated as opaque.

#[path = "api_error.rs"]
pub mod api_error;

#[path = "routes.rs"]
pub mod routes;

pub use api_error::ApiError;
pub use routes::router;

use std::sync::Arc;

use crate::core::compliance::ComplianceTracker;
use crate::core::connections::ConnectionManager;
use crate::core::documents::{DocumentSearchGateway, GenerationPipeline};

/// Shared state handed to every handler. Cloning only bumps the `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub connections: Arc<ConnectionManager>,
    pub search: Arc<DocumentSearchGateway>,
    pub generation: Arc<GenerationPipeline>,
    pub compliance: Arc<ComplianceTracker>,
}

/// Binds `bind` and serves until the process is stopped.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind, "Storage gateway listening");
    axum::serve(listener, app).await?;

    Ok(())
}
