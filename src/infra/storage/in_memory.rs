// In-memory implementations of the gateway's store traits.
//
// Used by tests and single-process runs (`GATEWAY_DATABASE_URL=memory`).
// They follow the same contracts as the SQLite stores, so the core can't tell
// them apart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::core::compliance::{AuditEntry, ComplianceRecord, ComplianceStore};
use crate::core::connections::{ConnectionStore, PendingOAuthState};
use crate::core::documents::{GenerationAuditEntry, GenerationAuditLog};
use crate::core::storage::{GatewayError, OAuthTokens, Provider, StorageConnection};

// ============================================================================
// CONNECTIONS
// ============================================================================

#[derive(Default)]
pub struct InMemoryConnectionStore {
    connections: DashMap<String, StorageConnection>,
    /// (user, provider) -> connection id. Enforces one connection per pair.
    by_owner: DashMap<(String, Provider), String>,
    pending_states: DashMap<String, PendingOAuthState>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn get(&self, id: &str) -> Result<Option<StorageConnection>, GatewayError> {
        Ok(self.connections.get(id).map(|c| c.clone()))
    }

    async fn find_by_user_and_provider(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<StorageConnection>, GatewayError> {
        let id = self
            .by_owner
            .get(&(user_id.to_string(), provider))
            .map(|id| id.clone());
        Ok(id.and_then(|id| self.connections.get(&id).map(|c| c.clone())))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<StorageConnection>, GatewayError> {
        let mut out: Vec<StorageConnection> = self
            .connections
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn upsert(
        &self,
        mut connection: StorageConnection,
    ) -> Result<StorageConnection, GatewayError> {
        let key = (connection.user_id.clone(), connection.provider);

        match self.by_owner.entry(key) {
            Entry::Occupied(owner) => {
                let existing_id = owner.get().clone();
                let created_at = self.connections.get(&existing_id).map(|c| c.created_at);
                connection.id = existing_id;
                if let Some(created_at) = created_at {
                    connection.created_at = created_at;
                }
                self.connections
                    .insert(connection.id.clone(), connection.clone());
            }
            Entry::Vacant(owner) => {
                owner.insert(connection.id.clone());
                self.connections
                    .insert(connection.id.clone(), connection.clone());
            }
        }

        Ok(connection)
    }

    async fn update_tokens(
        &self,
        id: &str,
        tokens: &OAuthTokens,
        used_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let mut connection = self
            .connections
            .get_mut(id)
            .ok_or_else(|| GatewayError::ConnectionNotFound(id.to_string()))?;
        connection.oauth_tokens = tokens.clone();
        connection.last_used_at = used_at;
        Ok(())
    }

    async fn touch(&self, id: &str, used_at: DateTime<Utc>) -> Result<(), GatewayError> {
        if let Some(mut connection) = self.connections.get_mut(id) {
            connection.last_used_at = used_at;
        }
        Ok(())
    }

    async fn update_folders(
        &self,
        id: &str,
        folder_ids: &[String],
        template_folder_id: Option<&str>,
    ) -> Result<bool, GatewayError> {
        match self.connections.get_mut(id) {
            Some(mut connection) => {
                connection.folder_ids = folder_ids.to_vec();
                connection.template_folder_id = template_folder_id.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, GatewayError> {
        match self.connections.remove(id) {
            Some((_, connection)) => {
                self.by_owner
                    .remove(&(connection.user_id.clone(), connection.provider));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save_pending_state(&self, state: &PendingOAuthState) -> Result<(), GatewayError> {
        self.pending_states
            .insert(state.nonce.clone(), state.clone());
        Ok(())
    }

    async fn purge_pending_states(&self, cutoff: DateTime<Utc>) -> Result<u64, GatewayError> {
        let before = self.pending_states.len();
        self.pending_states.retain(|_, state| state.created_at >= cutoff);
        Ok(before.saturating_sub(self.pending_states.len()) as u64)
    }

    async fn take_pending_state(
        &self,
        nonce: &str,
    ) -> Result<Option<PendingOAuthState>, GatewayError> {
        Ok(self.pending_states.remove(nonce).map(|(_, state)| state))
    }
}

// ============================================================================
// COMPLIANCE
// ============================================================================

#[derive(Default)]
pub struct InMemoryComplianceStore {
    /// (connection id, document id) -> record
    records: DashMap<(String, String), ComplianceRecord>,
}

impl InMemoryComplianceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ComplianceStore for InMemoryComplianceStore {
    async fn append_observation(
        &self,
        record: &ComplianceRecord,
        entry: &AuditEntry,
    ) -> Result<(), GatewayError> {
        let key = (record.connection_id.clone(), record.document_id.clone());

        self.records
            .entry(key)
            .and_modify(|existing| {
                existing.title = record.title.clone();
                existing.domain = record.domain.clone();
                existing.doc_type = record.doc_type;
                existing.last_modified = record.last_modified;
                existing.renewal_date = record.renewal_date;
                existing.compliance_status = record.compliance_status;
                existing.taxonomy = record.taxonomy.clone();
                existing.audit_trail.push(entry.clone());
            })
            .or_insert_with(|| ComplianceRecord {
                audit_trail: vec![entry.clone()],
                ..record.clone()
            });

        Ok(())
    }

    async fn get_record(
        &self,
        connection_id: &str,
        document_id: &str,
    ) -> Result<Option<ComplianceRecord>, GatewayError> {
        let key = (connection_id.to_string(), document_id.to_string());
        Ok(self.records.get(&key).map(|r| r.clone()))
    }

    async fn list_records(
        &self,
        connection_id: &str,
    ) -> Result<Vec<ComplianceRecord>, GatewayError> {
        let mut out: Vec<ComplianceRecord> = self
            .records
            .iter()
            .filter(|r| r.connection_id == connection_id)
            .map(|r| r.clone())
            .collect();
        out.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(out)
    }
}

// ============================================================================
// GENERATION AUDIT
// ============================================================================

#[derive(Default)]
pub struct InMemoryGenerationAudit {
    entries: DashMap<String, Vec<GenerationAuditEntry>>,
}

impl InMemoryGenerationAudit {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GenerationAuditLog for InMemoryGenerationAudit {
    async fn append(&self, entry: &GenerationAuditEntry) -> Result<(), GatewayError> {
        self.entries
            .entry(entry.connection_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn list_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<GenerationAuditEntry>, GatewayError> {
        Ok(self
            .entries
            .get(connection_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::test_support::sample_connection;

    #[tokio::test]
    async fn test_upsert_keeps_identity_per_user_and_provider() {
        let store = InMemoryConnectionStore::new();
        let first = store
            .upsert(sample_connection("a", Provider::DriveService, &["x"]))
            .await
            .unwrap();
        let second = store
            .upsert(sample_connection("b", Provider::DriveService, &["y"]))
            .await
            .unwrap();

        assert_eq!(second.id, "a");
        assert_eq!(second.created_at, first.created_at);
        assert!(store.get("b").await.unwrap().is_none());
        assert_eq!(store.get("a").await.unwrap().unwrap().folder_ids, vec!["y"]);

        store
            .upsert(sample_connection("c", Provider::WorkspacePlatform, &["z"]))
            .await
            .unwrap();
        assert_eq!(store.list_for_user("user-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_frees_the_owner_slot() {
        let store = InMemoryConnectionStore::new();
        store
            .upsert(sample_connection("a", Provider::DriveService, &["x"]))
            .await
            .unwrap();

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());

        let fresh = store
            .upsert(sample_connection("b", Provider::DriveService, &["x"]))
            .await
            .unwrap();
        assert_eq!(fresh.id, "b");
    }

    #[tokio::test]
    async fn test_pending_state_is_single_use() {
        let store = InMemoryConnectionStore::new();
        let state = PendingOAuthState {
            nonce: "n".to_string(),
            user_id: "user-1".to_string(),
            provider: Provider::DriveService,
            redirect_uri: "https://app/cb".to_string(),
            created_at: Utc::now(),
        };
        store.save_pending_state(&state).await.unwrap();

        assert_eq!(store.take_pending_state("n").await.unwrap(), Some(state));
        assert_eq!(store.take_pending_state("n").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_drops_only_stale_states() {
        let store = InMemoryConnectionStore::new();
        let now = Utc::now();
        for (nonce, age_minutes) in [("old", 30), ("fresh", 1)] {
            store
                .save_pending_state(&PendingOAuthState {
                    nonce: nonce.to_string(),
                    user_id: "user-1".to_string(),
                    provider: Provider::DriveService,
                    redirect_uri: "https://app/cb".to_string(),
                    created_at: now - chrono::Duration::minutes(age_minutes),
                })
                .await
                .unwrap();
        }

        let purged = store
            .purge_pending_states(now - chrono::Duration::minutes(10))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(store.take_pending_state("old").await.unwrap().is_none());
        assert!(store.take_pending_state("fresh").await.unwrap().is_some());
    }
}
