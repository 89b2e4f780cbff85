use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};

use crate::core::documents::{GenerationAuditEntry, GenerationAuditLog};
use crate::core::storage::GatewayError;

/// Append-only log of generated documents. Rows carry the destination pointer
/// and the names of the merged fields, never their values.
pub struct SqliteGenerationAudit {
    pool: Pool<Sqlite>,
}

impl SqliteGenerationAudit {
    pub async fn new(pool: Pool<Sqlite>) -> anyhow::Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS generation_audit (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                connection_id TEXT NOT NULL,
                pointer TEXT NOT NULL,
                field_names TEXT NOT NULL DEFAULT '[]',
                generated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl GenerationAuditLog for SqliteGenerationAudit {
    async fn append(&self, entry: &GenerationAuditEntry) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO generation_audit (connection_id, pointer, field_names, generated_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.connection_id)
        .bind(serde_json::to_string(&entry.pointer)?)
        .bind(serde_json::to_string(&entry.field_names)?)
        .bind(entry.generated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<GenerationAuditEntry>, GatewayError> {
        let rows = sqlx::query(
            "SELECT connection_id, pointer, field_names, generated_at FROM generation_audit \
             WHERE connection_id = ? ORDER BY seq",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let pointer: String = row.try_get("pointer")?;
                let field_names: String = row.try_get("field_names")?;
                Ok(GenerationAuditEntry {
                    connection_id: row.try_get("connection_id")?,
                    pointer: serde_json::from_str(&pointer)?,
                    field_names: serde_json::from_str(&field_names)?,
                    generated_at: row.try_get("generated_at")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::test_support::sample_pointer;
    use crate::infra::storage::open_pool;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_entries_persist_in_order() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("gateway.db").display());
        let audit = SqliteGenerationAudit::new(open_pool(&url).await.unwrap())
            .await
            .unwrap();

        for file_id in ["out-1", "out-2"] {
            audit
                .append(&GenerationAuditEntry {
                    connection_id: "conn-1".to_string(),
                    pointer: sample_pointer(file_id),
                    field_names: vec!["name".to_string()],
                    generated_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let entries = audit.list_for_connection("conn-1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pointer.file_id, "out-1");
        assert_eq!(entries[1].pointer, sample_pointer("out-2"));
        assert!(audit.list_for_connection("conn-2").await.unwrap().is_empty());
    }
}
