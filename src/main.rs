// This is the entry point of the storage gateway.
//
// **Architecture Overview:**
// - `core/` = Business logic (provider-agnostic)
// - `infra/` = Implementations of core traits (SQLite, DashMap, provider APIs)
// - `http/` = axum routes over the core services
//
// This file's job is to:
// 1. Load configuration
// 2. Open the metadata stores
// 3. Register the configured providers
// 4. Wire the services together and serve HTTP

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "http/http_layer.rs"]
mod http;
#[path = "infra/infra_layer.rs"]
mod infra;

mod config;

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::core::compliance::{ComplianceStore, ComplianceTracker};
use crate::core::connections::{ConnectionManager, ConnectionStore, TokenVault};
use crate::core::documents::{DocumentSearchGateway, GenerationAuditLog, GenerationPipeline};
use crate::core::storage::{ChunkedUploader, ProviderAdapter, ProviderRegistry};
use crate::http::AppState;
use crate::infra::providers::{GoogleDriveAdapter, MicrosoftGraphAdapter};
use crate::infra::storage::{
    open_pool, InMemoryComplianceStore, InMemoryConnectionStore, InMemoryGenerationAudit,
    SqliteComplianceStore, SqliteConnectionStore, SqliteGenerationAudit,
};

/// The three metadata stores, behind their core ports.
struct Stores {
    connections: Arc<dyn ConnectionStore>,
    compliance: Arc<dyn ComplianceStore>,
    generation_audit: Arc<dyn GenerationAuditLog>,
}

async fn open_stores(config: &GatewayConfig) -> anyhow::Result<Stores> {
    if config.uses_memory_stores() {
        tracing::warn!("Using in-memory stores; connections are lost on restart");
        return Ok(Stores {
            connections: Arc::new(InMemoryConnectionStore::new()),
            compliance: Arc::new(InMemoryComplianceStore::new()),
            generation_audit: Arc::new(InMemoryGenerationAudit::new()),
        });
    }

    let pool = open_pool(&config.database_url).await?;
    Ok(Stores {
        connections: Arc::new(SqliteConnectionStore::new(pool.clone()).await?),
        compliance: Arc::new(SqliteComplianceStore::new(pool.clone()).await?),
        generation_audit: Arc::new(SqliteGenerationAudit::new(pool).await?),
    })
}

fn build_registry(config: &GatewayConfig) -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    if let Some(settings) = config.google.clone() {
        let adapter = GoogleDriveAdapter::new(settings, config.meta_settings())?;
        registry.register(Arc::new(adapter) as Arc<dyn ProviderAdapter>);
    }
    if let Some(settings) = config.microsoft.clone() {
        let adapter = MicrosoftGraphAdapter::new(settings, config.meta_settings())?;
        registry.register(Arc::new(adapter) as Arc<dyn ProviderAdapter>);
    }

    if registry.providers().is_empty() {
        tracing::warn!(
            "No storage provider configured; set GOOGLE_CLIENT_ID or MICROSOFT_CLIENT_ID"
        );
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let config = GatewayConfig::from_env()?;

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // This is the "composition root" where we wire everything together.

    let stores = open_stores(&config).await?;
    let registry = Arc::new(build_registry(&config)?);

    let vault = Arc::new(TokenVault::new(
        stores.connections.clone(),
        registry.clone(),
        config.token_skew,
    ));

    let connections = Arc::new(ConnectionManager::new(
        stores.connections.clone(),
        registry.clone(),
        vault.clone(),
        config.oauth_state_ttl,
    ));

    let compliance = Arc::new(ComplianceTracker::new(
        stores.compliance,
        config.thresholds,
        config.renewal_days,
    ));

    let search = Arc::new(
        DocumentSearchGateway::new(stores.connections.clone(), registry.clone(), vault.clone())
            .with_compliance(compliance.clone()),
    );

    let generation = Arc::new(GenerationPipeline::new(
        stores.connections,
        registry,
        vault,
        ChunkedUploader::new(config.upload),
        stores.generation_audit,
    ));

    let state = AppState {
        connections,
        search,
        generation,
        compliance,
    };

    http::serve(state, &config.bind).await
}
