//! Transaction Management
//!
//! Every read and write of the version row goes through a transaction opened
//! here, at the isolation level the migration engine depends on.

use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::database::PoolError;
use crate::error::MigrationResult;

/// Isolation level of every transaction touching the version row
pub const ISOLATION_LEVEL: &str = "SERIALIZABLE";

/// Transaction configuration options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionConfig {
    pub read_only: bool,
}

impl TransactionConfig {
    /// Serializable, read-only
    pub fn read() -> Self {
        Self { read_only: true }
    }

    /// Serializable, read-write
    pub fn write() -> Self {
        Self { read_only: false }
    }

    /// The statement issued as the first command of the transaction
    pub fn set_transaction_sql(&self) -> String {
        let access = if self.read_only { "READ ONLY" } else { "READ WRITE" };
        format!("SET TRANSACTION ISOLATION LEVEL {} {}", ISOLATION_LEVEL, access)
    }
}

/// Open a transaction on `pool` configured by `config`.
///
/// The returned transaction rolls back when dropped; callers commit
/// explicitly once their work succeeded.
pub async fn begin(
    pool: &PgPool,
    config: TransactionConfig,
) -> MigrationResult<Transaction<'static, Postgres>> {
    if pool.is_closed() {
        return Err(PoolError::PoolClosed.into());
    }

    let mut tx = pool.begin().await?;
    sqlx::query(&config.set_transaction_sql())
        .execute(&mut *tx)
        .await?;

    debug!(
        isolation = ISOLATION_LEVEL,
        read_only = config.read_only,
        "transaction started"
    );
    Ok(tx)
}
