//! Script execution for a single migration file

use async_trait::async_trait;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlx::PgPool;

use crate::error::{MigrationError, MigrationResult};
use crate::transaction::{self, TransactionConfig};

/// Runs the SQL of one migration as a single unit of work
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Execute every statement in `sql`; either all of them take effect or
    /// none do.
    async fn execute_script(&self, sql: &str) -> MigrationResult<()>;
}

/// [`ScriptExecutor`] running each script inside one serializable
/// PostgreSQL transaction
#[derive(Debug, Clone)]
pub struct PgScriptExecutor {
    pool: PgPool,
}

impl PgScriptExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScriptExecutor for PgScriptExecutor {
    async fn execute_script(&self, sql: &str) -> MigrationResult<()> {
        let statements = split_sql_statements(sql);
        let mut tx = transaction::begin(&self.pool, TransactionConfig::write()).await?;

        for (index, statement) in statements.iter().enumerate() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|source| MigrationError::Script {
                    statement: index,
                    source,
                })?;
        }

        tx.commit().await?;
        tracing::debug!(statements = statements.len(), "migration script executed");
        Ok(())
    }
}

/// Split a script into individually executable statements.
///
/// Statements are parsed with the PostgreSQL dialect; if the parser does
/// not understand the script it is split on `;` instead.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(parsed) => parsed.iter().map(|stmt| stmt.to_string()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "SQL parsing failed, using naive semicolon splitting");
            sql.split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty() && !is_comment_only(s))
                .map(str::to_string)
                .collect()
        }
    }
}

fn is_comment_only(block: &str) -> bool {
    block
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}
