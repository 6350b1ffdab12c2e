//! PostgreSQL-backed store.

use crate::error::StoreError;
use crate::schema::SchemaMode;
use crate::store::TransactionStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;
use uuid::Uuid;

const INSERT_RECORD: &str = "INSERT INTO accounts (id, balance) VALUES ($1, $2)";
const UPDATE_BALANCE: &str = "UPDATE accounts SET balance = $1 WHERE id = $2";
const DELETE_RECORD: &str = "DELETE FROM accounts WHERE id = $1";
const SELECT_BALANCE: &str = "SELECT balance FROM accounts WHERE id = $1";

/// Connection settings for [`PgStore`].
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Pool size. One keeps a single persistent connection.
    pub max_connections: u32,
    /// How long a call waits for the connection before failing.
    pub acquire_timeout: Duration,
    /// Reported to the server as `application_name`.
    pub application_name: String,
}

impl PgStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            application_name: "txnsvc".to_string(),
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }
}

/// Record store over a PostgreSQL pool.
///
/// Concurrent calls share the pool; with the default size of one they queue
/// on the driver's connection acquisition rather than on any lock here.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects eagerly, so an unreachable database fails at startup.
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let options: PgConnectOptions = config.url.parse()?;
        let options = options.application_name(&config.application_name);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;

        tracing::debug!(
            "Connected to PostgreSQL (pool size {})",
            config.max_connections
        );
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionStore for PgStore {
    async fn prepare(&self, mode: SchemaMode) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Schema)?;
        for &statement in mode.statements() {
            tracing::info!("Schema ({}): {}", mode, statement);
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Schema)?;
        }
        tx.commit().await.map_err(StoreError::Schema)?;
        Ok(())
    }

    async fn insert(&self, id: Uuid, balance: i64) -> Result<(), StoreError> {
        sqlx::query(INSERT_RECORD)
            .bind(id)
            .bind(balance)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_balance(&self, id: Uuid, balance: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(UPDATE_BALANCE)
            .bind(balance)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(DELETE_RECORD)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_balance(&self, id: Uuid) -> Result<Option<i64>, StoreError> {
        let balance = sqlx::query_scalar::<_, i64>(SELECT_BALANCE)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
