use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tokio::time::timeout;

use crate::flags::flag_models::{FlagRecord, Targeting};
use crate::flags::flag_store::{FlagStore, StoreError};

pub const FLAGS_TABLE: &str = "feature_flag_records";

/// A flag row as stored in PostgreSQL. Targeting lives in a JSONB column.
#[derive(sqlx::FromRow)]
struct FlagRow {
    key: String,
    name: String,
    description: String,
    enabled: bool,
    targeting: Json<Targeting>,
    created_by: Option<String>,
    updated_by: Option<String>,
    last_toggled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<FlagRow> for FlagRecord {
    fn from(row: FlagRow) -> Self {
        FlagRecord {
            key: row.key,
            name: row.name,
            description: row.description,
            enabled: row.enabled,
            targeting: row.targeting.0,
            created_by: row.created_by,
            updated_by: row.updated_by,
            last_toggled_at: row.last_toggled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub struct PgFlagStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgFlagStore {
    pub async fn new(
        url: &str,
        max_connections: u32,
        query_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(query_timeout)
            .connect(url)
            .await?;

        Ok(Self::from_pool(pool, query_timeout))
    }

    pub fn from_pool(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    /// The store client has no deadline of its own, so every call gets one here.
    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match timeout(self.query_timeout, fut).await {
            Ok(result) => result.map_err(store_error),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.query_timeout.as_millis() as u64,
                    "flag store call timed out"
                );
                Err(StoreError::Timeout)
            }
        }
    }
}

/// Rows that no longer decode into a [`FlagRecord`] are reported as corrupted
/// rather than as a generic database failure.
fn store_error(e: sqlx::Error) -> StoreError {
    if matches!(e, sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) {
        tracing::error!(error = %e, "stored feature flag failed to decode");
        StoreError::Corrupted(e.to_string())
    } else {
        StoreError::Database(e)
    }
}

#[async_trait]
impl FlagStore for PgFlagStore {
    async fn list(&self) -> Result<Vec<FlagRecord>, StoreError> {
        let query = format!(r#"SELECT * FROM "{FLAGS_TABLE}" ORDER BY key"#);
        let rows: Vec<FlagRow> = self
            .timed(sqlx::query_as(&query).fetch_all(&self.pool))
            .await?;
        Ok(rows.into_iter().map(FlagRecord::from).collect())
    }

    async fn get(&self, key: &str) -> Result<Option<FlagRecord>, StoreError> {
        let query = format!(r#"SELECT * FROM "{FLAGS_TABLE}" WHERE key = $1"#);
        let row: Option<FlagRow> = self
            .timed(sqlx::query_as(&query).bind(key).fetch_optional(&self.pool))
            .await?;
        Ok(row.map(FlagRecord::from))
    }

    async fn insert(&self, flag: FlagRecord) -> Result<FlagRecord, StoreError> {
        let query = format!(
            r#"
INSERT INTO "{FLAGS_TABLE}"
    (key, name, description, enabled, targeting,
     created_by, updated_by, last_toggled_at, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (key) DO NOTHING
RETURNING *
            "#
        );

        let row: Option<FlagRow> = self
            .timed(
                sqlx::query_as(&query)
                    .bind(&flag.key)
                    .bind(&flag.name)
                    .bind(&flag.description)
                    .bind(flag.enabled)
                    .bind(Json(&flag.targeting))
                    .bind(&flag.created_by)
                    .bind(&flag.updated_by)
                    .bind(flag.last_toggled_at)
                    .bind(flag.created_at)
                    .bind(flag.updated_at)
                    .fetch_optional(&self.pool),
            )
            .await?;

        row.map(FlagRecord::from)
            .ok_or(StoreError::DuplicateKey(flag.key))
    }

    async fn replace(&self, flag: FlagRecord) -> Result<Option<FlagRecord>, StoreError> {
        let query = format!(
            r#"
UPDATE "{FLAGS_TABLE}"
SET
    name = $2,
    description = $3,
    enabled = $4,
    targeting = $5,
    updated_by = $6,
    last_toggled_at = $7,
    updated_at = $8
WHERE
    key = $1
RETURNING *
            "#
        );

        let row: Option<FlagRow> = self
            .timed(
                sqlx::query_as(&query)
                    .bind(&flag.key)
                    .bind(&flag.name)
                    .bind(&flag.description)
                    .bind(flag.enabled)
                    .bind(Json(&flag.targeting))
                    .bind(&flag.updated_by)
                    .bind(flag.last_toggled_at)
                    .bind(flag.updated_at)
                    .fetch_optional(&self.pool),
            )
            .await?;

        Ok(row.map(FlagRecord::from))
    }

    async fn delete(&self, key: &str) -> Result<Option<FlagRecord>, StoreError> {
        let query = format!(r#"DELETE FROM "{FLAGS_TABLE}" WHERE key = $1 RETURNING *"#);
        let row: Option<FlagRow> = self
            .timed(sqlx::query_as(&query).bind(key).fetch_optional(&self.pool))
            .await?;
        Ok(row.map(FlagRecord::from))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.timed(sqlx::query("SELECT 1").execute(&self.pool)).await?;
        Ok(())
    }
}
