// SQLite-backed ConnectionStore: the system of record for connections and
// pending OAuth states. Holds identifiers and tokens only, never document bytes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

use crate::core::connections::{ConnectionStore, PendingOAuthState};
use crate::core::storage::{
    ConnectionPermissions, GatewayError, OAuthTokens, Provider, StorageConnection,
};

const CONNECTION_COLUMNS: &str = "id, user_id, provider, tenant_id, folder_ids, \
     template_folder_id, access_token, refresh_token, expires_at_epoch_ms, can_read, \
     can_write, can_search, created_at, last_used_at";

pub struct SqliteConnectionStore {
    pool: Pool<Sqlite>,
}

impl SqliteConnectionStore {
    pub async fn new(pool: Pool<Sqlite>) -> anyhow::Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS storage_connections (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                tenant_id TEXT,
                folder_ids TEXT NOT NULL DEFAULT '[]',
                template_folder_id TEXT,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at_epoch_ms INTEGER NOT NULL,
                can_read BOOLEAN NOT NULL DEFAULT 1,
                can_write BOOLEAN NOT NULL DEFAULT 1,
                can_search BOOLEAN NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_used_at TEXT NOT NULL,
                UNIQUE (user_id, provider)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_states (
                nonce TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                redirect_uri TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn storage_err(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Storage(e.to_string())
}

fn row_to_connection(row: &SqliteRow) -> Result<StorageConnection, GatewayError> {
    let provider: String = row.try_get("provider")?;
    let folder_ids: String = row.try_get("folder_ids")?;

    Ok(StorageConnection {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: provider.parse::<Provider>().map_err(storage_err)?,
        tenant_id: row.try_get("tenant_id")?,
        folder_ids: serde_json::from_str(&folder_ids)?,
        template_folder_id: row.try_get("template_folder_id")?,
        oauth_tokens: OAuthTokens {
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            expires_at_epoch_ms: row.try_get("expires_at_epoch_ms")?,
        },
        permissions: ConnectionPermissions {
            read: row.try_get("can_read")?,
            write: row.try_get("can_write")?,
            search: row.try_get("can_search")?,
        },
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

#[async_trait]
impl ConnectionStore for SqliteConnectionStore {
    async fn get(&self, id: &str) -> Result<Option<StorageConnection>, GatewayError> {
        let sql = format!("SELECT {} FROM storage_connections WHERE id = ?", CONNECTION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_connection).transpose()
    }

    async fn find_by_user_and_provider(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<StorageConnection>, GatewayError> {
        let sql = format!(
            "SELECT {} FROM storage_connections WHERE user_id = ? AND provider = ?",
            CONNECTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(provider.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_connection).transpose()
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<StorageConnection>, GatewayError> {
        let sql = format!(
            "SELECT {} FROM storage_connections WHERE user_id = ? ORDER BY created_at",
            CONNECTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_connection).collect()
    }

    async fn upsert(
        &self,
        connection: StorageConnection,
    ) -> Result<StorageConnection, GatewayError> {
        let folder_ids = serde_json::to_string(&connection.folder_ids)?;

        // id and created_at survive a reconnect; everything else is replaced.
        sqlx::query(
            r#"
            INSERT INTO storage_connections (
                id, user_id, provider, tenant_id, folder_ids, template_folder_id,
                access_token, refresh_token, expires_at_epoch_ms,
                can_read, can_write, can_search, created_at, last_used_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                folder_ids = excluded.folder_ids,
                template_folder_id = excluded.template_folder_id,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at_epoch_ms = excluded.expires_at_epoch_ms,
                can_read = excluded.can_read,
                can_write = excluded.can_write,
                can_search = excluded.can_search,
                last_used_at = excluded.last_used_at
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.user_id)
        .bind(connection.provider.as_str())
        .bind(&connection.tenant_id)
        .bind(folder_ids)
        .bind(&connection.template_folder_id)
        .bind(&connection.oauth_tokens.access_token)
        .bind(&connection.oauth_tokens.refresh_token)
        .bind(connection.oauth_tokens.expires_at_epoch_ms)
        .bind(connection.permissions.read)
        .bind(connection.permissions.write)
        .bind(connection.permissions.search)
        .bind(connection.created_at)
        .bind(connection.last_used_at)
        .execute(&self.pool)
        .await?;

        self.find_by_user_and_provider(&connection.user_id, connection.provider)
            .await?
            .ok_or_else(|| GatewayError::Storage("upserted connection vanished".to_string()))
    }

    async fn update_tokens(
        &self,
        id: &str,
        tokens: &OAuthTokens,
        used_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let result = sqlx::query(
            r#"
            UPDATE storage_connections
            SET access_token = ?, refresh_token = ?, expires_at_epoch_ms = ?, last_used_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at_epoch_ms)
        .bind(used_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::ConnectionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn touch(&self, id: &str, used_at: DateTime<Utc>) -> Result<(), GatewayError> {
        sqlx::query("UPDATE storage_connections SET last_used_at = ? WHERE id = ?")
            .bind(used_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_folders(
        &self,
        id: &str,
        folder_ids: &[String],
        template_folder_id: Option<&str>,
    ) -> Result<bool, GatewayError> {
        let folder_ids = serde_json::to_string(folder_ids)?;
        let result = sqlx::query(
            "UPDATE storage_connections SET folder_ids = ?, template_folder_id = ? WHERE id = ?",
        )
        .bind(folder_ids)
        .bind(template_folder_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &str) -> Result<bool, GatewayError> {
        let result = sqlx::query("DELETE FROM storage_connections WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_pending_state(&self, state: &PendingOAuthState) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO oauth_states (nonce, user_id, provider, redirect_uri, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&state.nonce)
        .bind(&state.user_id)
        .bind(state.provider.as_str())
        .bind(&state.redirect_uri)
        .bind(state.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_pending_states(&self, cutoff: DateTime<Utc>) -> Result<u64, GatewayError> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn take_pending_state(
        &self,
        nonce: &str,
    ) -> Result<Option<PendingOAuthState>, GatewayError> {
        let row = sqlx::query(
            "DELETE FROM oauth_states WHERE nonce = ? \
             RETURNING nonce, user_id, provider, redirect_uri, created_at",
        )
        .bind(nonce)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let provider: String = row.try_get("provider")?;
        Ok(Some(PendingOAuthState {
            nonce: row.try_get("nonce")?,
            user_id: row.try_get("user_id")?,
            provider: provider.parse::<Provider>().map_err(storage_err)?,
            redirect_uri: row.try_get("redirect_uri")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}
