//! Version Store - the single `db_version` row
//!
//! The row is the only shared mutable state between runner instances.
//! It is read and written exclusively through [`VersionStore`], whose
//! PostgreSQL implementation runs every access in a serializable
//! transaction and guards each write with a predicate on the row's
//! current contents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::definitions::{Migration, PersistedState};
use crate::error::{MigrationError, MigrationResult};
use crate::transaction::{self, TransactionConfig};

/// Persisted checkpoint of the last migration the database reached
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Read the tracked row. `None` only before the first bootstrap.
    async fn current(&self) -> MigrationResult<Option<PersistedState>>;

    /// Insert the version 0 row if it is missing and return the row.
    async fn bootstrap(&self) -> MigrationResult<PersistedState>;

    /// Record that `migration` is about to run: overwrite the row with its
    /// identity and `complete = false`. Must commit before the migration's
    /// SQL executes.
    async fn begin_step(&self, migration: &Migration) -> MigrationResult<()>;

    /// Mark `version` complete, provided the row still holds that version.
    async fn complete_step(&self, version: u64) -> MigrationResult<()>;

    /// Manually mark a failed checkpoint at `version` as complete, after an
    /// operator has repaired the schema by hand.
    async fn resolve(&self, version: u64) -> MigrationResult<PersistedState>;
}

/// Read the tracked row, bootstrapping it on first contact.
pub async fn ensure_state<S>(store: &S) -> MigrationResult<PersistedState>
where
    S: VersionStore + ?Sized,
{
    match store.current().await {
        Ok(Some(state)) => Ok(state),
        Ok(None) => {
            tracing::info!("no migration state found, bootstrapping version 0");
            store
                .bootstrap()
                .await
                .map_err(|e| MigrationError::Bootstrap(Box::new(e)))
        }
        Err(e) => Err(MigrationError::Bootstrap(Box::new(e))),
    }
}

/// [`VersionStore`] backed by the `db_version` table
#[derive(Debug, Clone)]
pub struct PgVersionStore {
    pool: PgPool,
}

impl PgVersionStore {
    /// Sentinel primary key of the tracked row
    pub const ROW_ID: &'static str = "1";

    pub const CREATE_TABLE_SQL: &'static str = "CREATE TABLE IF NOT EXISTS db_version (
            id VARCHAR(1),
            version BIGINT,
            hash VARCHAR(256),
            file VARCHAR(256),
            last_run TIMESTAMPTZ,
            complete BOOLEAN
        )";

    const SELECT_SQL: &'static str =
        "SELECT version, hash, file, last_run, complete FROM db_version WHERE id = $1 LIMIT 1";

    const BOOTSTRAP_SQL: &'static str = "INSERT INTO db_version (id, version, hash, file, last_run, complete)
        SELECT $1, 0, '', '', $2, TRUE
        WHERE NOT EXISTS (SELECT 1 FROM db_version WHERE id = $1)";

    const BEGIN_STEP_SQL: &'static str = "UPDATE db_version
        SET version = $2, hash = $3, file = $4, last_run = $5, complete = FALSE
        WHERE id = $1 AND complete = TRUE AND version < $2";

    const COMPLETE_STEP_SQL: &'static str = "UPDATE db_version
        SET complete = TRUE, last_run = $3
        WHERE id = $1 AND version = $2 AND complete = FALSE";

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn mark_complete(&self, version: u64, now: DateTime<Utc>) -> MigrationResult<u64> {
        let mut tx = transaction::begin(&self.pool, TransactionConfig::write()).await?;
        let result = sqlx::query(Self::COMPLETE_STEP_SQL)
            .bind(Self::ROW_ID)
            .bind(to_db_version(version)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl VersionStore for PgVersionStore {
    async fn current(&self) -> MigrationResult<Option<PersistedState>> {
        let mut tx = transaction::begin(&self.pool, TransactionConfig::read()).await?;
        let row = sqlx::query(Self::SELECT_SQL)
            .bind(Self::ROW_ID)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        row.as_ref().map(state_from_row).transpose()
    }

    async fn bootstrap(&self) -> MigrationResult<PersistedState> {
        let mut tx = transaction::begin(&self.pool, TransactionConfig::write()).await?;
        sqlx::query(Self::BOOTSTRAP_SQL)
            .bind(Self::ROW_ID)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(Self::SELECT_SQL)
            .bind(Self::ROW_ID)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        state_from_row(&row)
    }

    async fn begin_step(&self, migration: &Migration) -> MigrationResult<()> {
        let mut tx = transaction::begin(&self.pool, TransactionConfig::write()).await?;
        let result = sqlx::query(Self::BEGIN_STEP_SQL)
            .bind(Self::ROW_ID)
            .bind(to_db_version(migration.version)?)
            .bind(&migration.hash)
            .bind(migration.file_name())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MigrationError::CheckpointMoved {
                version: migration.version,
            });
        }

        tx.commit().await?;
        Ok(())
    }

    async fn complete_step(&self, version: u64) -> MigrationResult<()> {
        match self.mark_complete(version, Utc::now()).await? {
            0 => Err(MigrationError::CheckpointMoved { version }),
            _ => Ok(()),
        }
    }

    async fn resolve(&self, version: u64) -> MigrationResult<PersistedState> {
        if self.mark_complete(version, Utc::now()).await? == 0 {
            let current = self.current().await?;
            return Err(MigrationError::NotResolvable {
                version,
                current: current.as_ref().map_or(0, |s| s.version),
                complete: current.map_or(true, |s| s.complete),
            });
        }

        tracing::warn!(version, "failed migration manually marked complete");
        self.current()
            .await?
            .ok_or(MigrationError::CheckpointMoved { version })
    }
}

fn state_from_row(row: &PgRow) -> MigrationResult<PersistedState> {
    let version: i64 = row.try_get("version")?;
    Ok(PersistedState {
        version: u64::try_from(version).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        hash: row.try_get("hash")?,
        file: row.try_get("file")?,
        last_run: row.try_get("last_run")?,
        complete: row.try_get("complete")?,
    })
}

fn to_db_version(version: u64) -> MigrationResult<i64> {
    i64::try_from(version).map_err(|e| sqlx::Error::Encode(Box::new(e)).into())
}
