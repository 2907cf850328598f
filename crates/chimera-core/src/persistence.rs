//! Durable download list
//!
//! The list is stored as one JSON document so a write replaces the whole
//! list atomically and the persisted order is the registry order.

use crate::error::ChimeraError;
use async_trait::async_trait;
use chimera_types::Download;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::path::Path;

const DOWNLOADS_KEY: &str = "downloads";

#[async_trait]
pub trait DownloadStore: Send + Sync {
    /// The last saved list, or `None` if nothing was ever saved
    async fn get(&self) -> Result<Option<Vec<Download>>, ChimeraError>;

    async fn set(&self, downloads: &[Download]) -> Result<(), ChimeraError>;
}

/// Key/value table in a SQLite database
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, ChimeraError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database. A single connection that is never
    /// recycled, since each new connection would see an empty database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, ChimeraError> {
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, ChimeraError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DownloadStore for SqliteStore {
    async fn get(&self) -> Result<Option<Vec<Download>>, ChimeraError> {
        let row = sqlx::query("SELECT value FROM store WHERE key = ?")
            .bind(DOWNLOADS_KEY)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let value: String = row.try_get("value")?;
        Ok(Some(serde_json::from_str(&value)?))
    }

    async fn set(&self, downloads: &[Download]) -> Result<(), ChimeraError> {
        let value = serde_json::to_string(downloads)?;

        sqlx::query(
            r#"
            INSERT INTO store (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(DOWNLOADS_KEY)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
