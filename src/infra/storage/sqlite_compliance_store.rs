// SQLite-backed ComplianceStore.
//
// `compliance_records` holds the latest observation per (connection, document);
// `compliance_audit` is append-only and ordered by its autoincrement sequence.
// Neither table is ever deleted from.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

use crate::core::compliance::{AuditEntry, ComplianceRecord, ComplianceStore};
use crate::core::storage::{ComplianceStatus, DocType, GatewayError};

pub struct SqliteComplianceStore {
    pool: Pool<Sqlite>,
}

impl SqliteComplianceStore {
    pub async fn new(pool: Pool<Sqlite>) -> anyhow::Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS compliance_records (
                id TEXT NOT NULL UNIQUE,
                connection_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                title TEXT NOT NULL,
                domain TEXT NOT NULL DEFAULT '[]',
                doc_type TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                renewal_date TEXT NOT NULL,
                compliance_status TEXT NOT NULL,
                taxonomy TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (connection_id, document_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS compliance_audit (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                connection_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                action TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_compliance_audit_doc \
             ON compliance_audit (connection_id, document_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_trail(
        &self,
        connection_id: &str,
        document_id: &str,
    ) -> Result<Vec<AuditEntry>, GatewayError> {
        let rows = sqlx::query(
            "SELECT action, timestamp, metadata FROM compliance_audit \
             WHERE connection_id = ? AND document_id = ? ORDER BY seq",
        )
        .bind(connection_id)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let metadata: String = row.try_get("metadata")?;
                Ok(AuditEntry {
                    action: row.try_get("action")?,
                    timestamp: row.try_get("timestamp")?,
                    metadata: serde_json::from_str(&metadata)?,
                })
            })
            .collect()
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ComplianceRecord, GatewayError> {
    let domain: String = row.try_get("domain")?;
    let taxonomy: String = row.try_get("taxonomy")?;
    let doc_type: String = row.try_get("doc_type")?;
    let status: String = row.try_get("compliance_status")?;

    Ok(ComplianceRecord {
        id: row.try_get("id")?,
        connection_id: row.try_get("connection_id")?,
        document_id: row.try_get("document_id")?,
        title: row.try_get("title")?,
        domain: serde_json::from_str(&domain)?,
        doc_type: doc_type
            .parse::<DocType>()
            .map_err(|e| GatewayError::Storage(e.to_string()))?,
        last_modified: row.try_get("last_modified")?,
        renewal_date: row.try_get("renewal_date")?,
        compliance_status: status
            .parse::<ComplianceStatus>()
            .map_err(|e| GatewayError::Storage(e.to_string()))?,
        taxonomy: serde_json::from_str(&taxonomy)?,
        audit_trail: Vec::new(),
    })
}

#[async_trait]
impl ComplianceStore for SqliteComplianceStore {
    async fn append_observation(
        &self,
        record: &ComplianceRecord,
        entry: &AuditEntry,
    ) -> Result<(), GatewayError> {
        let domain = serde_json::to_string(&record.domain)?;
        let taxonomy = serde_json::to_string(&record.taxonomy)?;
        let metadata = serde_json::to_string(&entry.metadata)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO compliance_records (
                id, connection_id, document_id, title, domain, doc_type,
                last_modified, renewal_date, compliance_status, taxonomy
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, document_id) DO UPDATE SET
                title = excluded.title,
                domain = excluded.domain,
                doc_type = excluded.doc_type,
                last_modified = excluded.last_modified,
                renewal_date = excluded.renewal_date,
                compliance_status = excluded.compliance_status,
                taxonomy = excluded.taxonomy
            "#,
        )
        .bind(&record.id)
        .bind(&record.connection_id)
        .bind(&record.document_id)
        .bind(&record.title)
        .bind(domain)
        .bind(record.doc_type.as_str())
        .bind(record.last_modified)
        .bind(record.renewal_date)
        .bind(record.compliance_status.as_str())
        .bind(taxonomy)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO compliance_audit (connection_id, document_id, action, timestamp, metadata) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.connection_id)
        .bind(&record.document_id)
        .bind(&entry.action)
        .bind(entry.timestamp)
        .bind(metadata)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_record(
        &self,
        connection_id: &str,
        document_id: &str,
    ) -> Result<Option<ComplianceRecord>, GatewayError> {
        let row = sqlx::query(
            "SELECT * FROM compliance_records WHERE connection_id = ? AND document_id = ?",
        )
        .bind(connection_id)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = row_to_record(&row)?;
        record.audit_trail = self.load_trail(connection_id, document_id).await?;
        Ok(Some(record))
    }

    async fn list_records(
        &self,
        connection_id: &str,
    ) -> Result<Vec<ComplianceRecord>, GatewayError> {
        let rows = sqlx::query(
            "SELECT * FROM compliance_records WHERE connection_id = ? ORDER BY document_id",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = row_to_record(row)?;
            record.audit_trail = self
                .load_trail(&record.connection_id, &record.document_id)
                .await?;
            records.push(record);
        }
        Ok(records)
    }
}
