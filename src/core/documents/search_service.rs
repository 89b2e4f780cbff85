// Document Search Gateway: one query against the provider that owns the
// connection. Federating across a user's connections is up to the caller.
//
// Nothing is cached. Every call goes back to the provider so ACL and content
// changes show up immediately.

use std::sync::Arc;

use crate::core::compliance::{ComplianceRules, ComplianceTracker};
use crate::core::connections::{ConnectionStore, TokenVault};
use crate::core::storage::{
    GatewayError, KnowledgeDocumentMeta, ProviderRegistry, SearchOptions,
};

pub struct DocumentSearchGateway {
    connections: Arc<dyn ConnectionStore>,
    providers: Arc<ProviderRegistry>,
    vault: Arc<TokenVault>,
    compliance: Option<Arc<ComplianceTracker>>,
}

impl DocumentSearchGateway {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        providers: Arc<ProviderRegistry>,
        vault: Arc<TokenVault>,
    ) -> Self {
        Self {
            connections,
            providers,
            vault,
            compliance: None,
        }
    }

    /// Enables `track_compliance` on searches.
    pub fn with_compliance(mut self, tracker: Arc<ComplianceTracker>) -> Self {
        self.compliance = Some(tracker);
        self
    }

    pub async fn search_documents(
        &self,
        connection_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<KnowledgeDocumentMeta>, GatewayError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(GatewayError::InvalidRequest("query must not be empty".to_string()));
        }
        if options.max_docs == 0 {
            return Err(GatewayError::InvalidRequest(
                "maxDocs must be at least 1".to_string(),
            ));
        }

        let connection = self.connections.require(connection_id).await?;
        if !connection.permissions.search {
            return Err(GatewayError::InvalidRequest(
                "connection was not granted search access".to_string(),
            ));
        }
        if connection.folder_ids.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "connection has no authorized folders".to_string(),
            ));
        }

        let adapter = self.providers.get(connection.provider)?;
        let token = self.vault.get_valid_access_token(&connection).await?;

        let mut results = adapter.search(&connection, &token, query, options).await?;
        if !options.domains.is_empty() {
            results.retain(|meta| meta.domain.iter().any(|d| options.domains.contains(d)));
        }
        results.truncate(options.max_docs);

        tracing::info!(
            connection_id,
            provider = %connection.provider,
            hits = results.len(),
            "Document search finished"
        );

        if options.track_compliance {
            self.track_results(connection_id, &results).await;
        }

        Ok(results)
    }

    /// Best effort: a tracking failure never fails the search.
    async fn track_results(&self, connection_id: &str, results: &[KnowledgeDocumentMeta]) {
        let Some(tracker) = &self.compliance else {
            tracing::warn!(connection_id, "Compliance tracking requested but not enabled");
            return;
        };

        let rules = ComplianceRules::default();
        for meta in results {
            if let Err(e) = tracker
                .track_compliance_document(connection_id, meta, &rules)
                .await
            {
                tracing::warn!(
                    connection_id,
                    document_id = %meta.pointer.file_id,
                    "Compliance tracking failed: {}",
                    e
                );
            }
        }
    }
}
