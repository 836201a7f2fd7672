//! PostgreSQL connection handling
//!
//! Builds the connection pool from [`DatabaseConfig`], creates the
//! `db_version` table, and bootstraps its single row on first contact.

use std::str::FromStr;
use std::time::{Duration, Instant};

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Postgres, Transaction};

use crate::config::DatabaseConfig;
use crate::error::{MigrationError, MigrationResult};
use crate::migrations::executor::PgScriptExecutor;
use crate::migrations::store::{ensure_state, PgVersionStore};
use crate::transaction::{self, TransactionConfig};

/// Database connection pool error types
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Connection failed: {0}")]
    ConnectFailed(#[source] sqlx::Error),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Connection timeout after {timeout:?}")]
    ConnectionTimeout { timeout: Duration },

    #[error("Health check failed: {reason}")]
    HealthCheckFailed { reason: String },
}

/// Handle to the migrated database
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
    acquire_timeout: Duration,
}

impl Database {
    /// Connect, create the version table if needed, and make sure the
    /// tracked row exists.
    pub async fn connect(config: &DatabaseConfig) -> MigrationResult<Self> {
        config.validate()?;

        tracing::debug!(
            database = %config.redacted_target(),
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            max_lifetime = ?config.max_lifetime,
            "creating database pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect_with(connect_options(config)?)
            .await
            .map_err(|e| classify_error(e, config.acquire_timeout))?;

        let database = Self::from_pool(pool, config.acquire_timeout);
        database.ensure_version_table().await?;

        let store = database.version_store();
        ensure_state(&store).await?;

        tracing::info!(database = %config.redacted_target(), "database ready");
        Ok(database)
    }

    /// Wrap an existing pool. The version table is not touched.
    pub fn from_pool(pool: PgPool, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            acquire_timeout,
        }
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn version_store(&self) -> PgVersionStore {
        PgVersionStore::new(self.pool.clone())
    }

    pub fn script_executor(&self) -> PgScriptExecutor {
        PgScriptExecutor::new(self.pool.clone())
    }

    /// Serializable, read-only transaction
    pub async fn begin_read(&self) -> MigrationResult<Transaction<'static, Postgres>> {
        transaction::begin(&self.pool, TransactionConfig::read()).await
    }

    /// Serializable, read-write transaction
    pub async fn begin_write(&self) -> MigrationResult<Transaction<'static, Postgres>> {
        transaction::begin(&self.pool, TransactionConfig::write()).await
    }

    /// Round-trip a trivial query to check for signs of life
    pub async fn ping(&self) -> MigrationResult<Duration> {
        if self.pool.is_closed() {
            return Err(PoolError::PoolClosed.into());
        }

        let start = Instant::now();
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| classify_error(e, self.acquire_timeout))?;

        sqlx::query("SELECT 1")
            .execute(&mut *conn)
            .await
            .map_err(|e| PoolError::HealthCheckFailed {
                reason: e.to_string(),
            })?;

        let elapsed = start.elapsed();
        tracing::debug!(?elapsed, "database ping succeeded");
        Ok(elapsed)
    }

    /// Gracefully close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ensure_version_table(&self) -> MigrationResult<()> {
        sqlx::query(PgVersionStore::CREATE_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| MigrationError::Bootstrap(Box::new(e.into())))?;
        Ok(())
    }
}

fn connect_options(config: &DatabaseConfig) -> MigrationResult<PgConnectOptions> {
    if let Some(url) = &config.url {
        return Ok(PgConnectOptions::from_str(url)?);
    }

    let ssl_mode = if config.ssl_disabled {
        PgSslMode::Disable
    } else {
        PgSslMode::Require
    };

    Ok(PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.database_name)
        .ssl_mode(ssl_mode))
}

fn classify_error(error: sqlx::Error, timeout: Duration) -> MigrationError {
    let pool_error = match error {
        sqlx::Error::PoolTimedOut => PoolError::ConnectionTimeout { timeout },
        sqlx::Error::PoolClosed => PoolError::PoolClosed,
        other => PoolError::ConnectFailed(other),
    };
    tracing::error!(error = %pool_error, "failed to acquire database connection");
    pool_error.into()
}
