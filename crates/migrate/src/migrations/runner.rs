//! Migration Runner - Applies pending migrations against the database
//!
//! Each pending migration goes through three steps, strictly in ascending
//! version order:
//!
//! 1. `begin_step` commits the version row with `complete = false`
//! 2. the script runs as one unit of work
//! 3. `complete_step` flips the row back to `complete = true`
//!
//! The first failure at any step stops the run. A failure after step 1
//! leaves the row incomplete on purpose: the next run refuses to start
//! until someone looks at it.

use std::sync::Arc;

use thiserror::Error;

use super::definitions::{Migration, MigrationStatus, PersistedState};
use super::discovery::hash_contents;
use super::executor::ScriptExecutor;
use super::ordering::{is_strictly_ascending, sort_migrations};
use super::store::VersionStore;
use crate::error::{MigrationError, MigrationResult, StepStage};

/// A run that stopped early, with the progress it made before stopping
#[derive(Debug, Error)]
#[error("Migration run halted ({status}): {error}")]
pub struct RunFailure {
    pub status: MigrationStatus,
    #[source]
    pub error: MigrationError,
}

/// Executes classified migrations one at a time
#[derive(Clone)]
pub struct MigrationRunner {
    store: Arc<dyn VersionStore>,
    executor: Arc<dyn ScriptExecutor>,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn VersionStore>, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self { store, executor }
    }

    /// Apply every migration not marked complete, counting complete ones as
    /// skipped. `current` is the checkpoint the migrations were diffed
    /// against.
    pub async fn run(
        &self,
        current: &PersistedState,
        mut migrations: Vec<Migration>,
    ) -> Result<MigrationStatus, RunFailure> {
        sort_migrations(&mut migrations);
        debug_assert!(is_strictly_ascending(&migrations), "duplicate migration versions");
        let mut status = MigrationStatus::starting_at(current.version);

        for migration in &migrations {
            if migration.complete {
                status.skipped += 1;
                continue;
            }

            if let Err(error) = self.apply(migration).await {
                status.failed += 1;
                log_failure(migration, &error);
                return Err(RunFailure { status, error });
            }

            status.applied += 1;
            status.latest = migration.version;
            tracing::info!(
                version = migration.version,
                file = %migration.file.display(),
                "applied migration"
            );
        }

        tracing::info!(
            applied = status.applied,
            skipped = status.skipped,
            latest = status.latest,
            "migrations finished"
        );
        Ok(status)
    }

    async fn apply(&self, migration: &Migration) -> MigrationResult<()> {
        let step = |stage: StepStage| {
            move |source: MigrationError| {
                MigrationError::step(stage, migration.version, &migration.file, source)
            }
        };

        self.store
            .begin_step(migration)
            .await
            .map_err(step(StepStage::Begin))?;

        let sql = tokio::fs::read_to_string(&migration.file)
            .await
            .map_err(|e| MigrationError::io(&migration.file, e))
            .map_err(step(StepStage::Apply))?;

        // The row now carries the discovered hash; refuse to run anything else.
        let found = hash_contents(sql.as_bytes());
        if found != migration.hash {
            return Err(step(StepStage::Apply)(MigrationError::Drift {
                version: migration.version,
                file: migration.file.clone(),
                recorded: migration.hash.clone(),
                found,
            }));
        }

        self.executor
            .execute_script(&sql)
            .await
            .map_err(step(StepStage::Apply))?;

        self.store
            .complete_step(migration.version)
            .await
            .map_err(step(StepStage::Complete))
    }
}

fn log_failure(migration: &Migration, error: &MigrationError) {
    let message = match error.stage() {
        Some(StepStage::Begin) => "failed to start migration",
        Some(StepStage::Complete) => "failed to complete migration",
        _ => "failed to apply migration",
    };
    tracing::error!(
        version = migration.version,
        file = %migration.file.display(),
        error = %error,
        "{}",
        message
    );

    if error.is_concurrent_conflict() {
        tracing::warn!(
            version = migration.version,
            "the version row changed underneath this run; another migrator may be active"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::memory::{MemoryExecutor, MemoryVersionStore};
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryVersionStore>,
        executor: Arc<MemoryExecutor>,
        runner: MigrationRunner,
        migrations: Vec<Migration>,
    }

    fn fixture(scripts: &[(u64, &str)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let migrations = scripts
            .iter()
            .map(|(version, sql)| {
                let path = dir.path().join(format!("{version}.sql"));
                fs::write(&path, sql).unwrap();
                Migration::new(*version, path, hash_contents(sql.as_bytes()))
            })
            .collect();

        let store = Arc::new(MemoryVersionStore::with_state(PersistedState::bootstrap(
            Utc::now(),
        )));
        let executor = Arc::new(MemoryExecutor::new());
        let runner = MigrationRunner::new(store.clone(), executor.clone());

        Fixture {
            _dir: dir,
            store,
            executor,
            runner,
            migrations,
        }
    }

    #[tokio::test]
    async fn test_applies_in_version_order() {
        let mut fx = fixture(&[(3, "SELECT 3;"), (1, "SELECT 1;"), (2, "SELECT 2;")]);
        fx.migrations.reverse();
        let state = fx.store.snapshot().await.unwrap();

        let status = fx.runner.run(&state, fx.migrations).await.unwrap();

        assert_eq!(status.applied, 3);
        assert_eq!(status.latest, 3);
        assert_eq!(
            fx.executor.executed().await,
            vec!["SELECT 1;", "SELECT 2;", "SELECT 3;"]
        );
    }

    #[tokio::test]
    async fn test_complete_migrations_are_skipped_without_side_effects() {
        let mut fx = fixture(&[(1, "SELECT 1;"), (2, "SELECT 2;")]);
        for migration in &mut fx.migrations {
            migration.complete = true;
        }
        let state = fx.store.snapshot().await.unwrap();

        let status = fx.runner.run(&state, fx.migrations).await.unwrap();

        assert_eq!(status, MigrationStatus { applied: 0, failed: 0, skipped: 2, latest: 0 });
        assert!(fx.executor.executed().await.is_empty());
        assert_eq!(fx.store.snapshot().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_script_failure_stops_run_and_leaves_marker() {
        let fx = fixture(&[(1, "SELECT 1;"), (2, "BROKEN;"), (3, "SELECT 3;")]);
        fx.executor.fail_when_contains("BROKEN").await;
        let state = fx.store.snapshot().await.unwrap();

        let failure = fx.runner.run(&state, fx.migrations).await.unwrap_err();

        assert_eq!(
            failure.status,
            MigrationStatus { applied: 1, failed: 1, skipped: 0, latest: 1 }
        );
        assert_eq!(failure.error.stage(), Some(StepStage::Apply));
        assert_eq!(fx.executor.executed().await, vec!["SELECT 1;"]);

        let row = fx.store.snapshot().await.unwrap();
        assert_eq!((row.version, row.complete), (2, false));
    }

    #[tokio::test]
    async fn test_begin_failure_stops_before_running_sql() {
        let fx = fixture(&[(1, "SELECT 1;"), (2, "SELECT 2;")]);
        fx.store.fail_on(StepStage::Begin, 1).await;
        let state = fx.store.snapshot().await.unwrap();

        let failure = fx.runner.run(&state, fx.migrations).await.unwrap_err();

        assert_eq!(failure.status.failed, 1);
        assert_eq!(failure.status.applied, 0);
        assert_eq!(failure.error.stage(), Some(StepStage::Begin));
        assert!(fx.executor.executed().await.is_empty());
        assert_eq!(fx.store.snapshot().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_complete_failure_reports_after_sql_ran() {
        let fx = fixture(&[(1, "SELECT 1;"), (2, "SELECT 2;")]);
        fx.store.fail_on(StepStage::Complete, 1).await;
        let state = fx.store.snapshot().await.unwrap();

        let failure = fx.runner.run(&state, fx.migrations).await.unwrap_err();

        assert_eq!(failure.error.stage(), Some(StepStage::Complete));
        assert_eq!(fx.executor.executed().await, vec!["SELECT 1;"]);
        let row = fx.store.snapshot().await.unwrap();
        assert_eq!((row.version, row.complete), (1, false));
    }

    #[tokio::test]
    async fn test_stale_checkpoint_is_rejected_at_begin() {
        let fx = fixture(&[(1, "SELECT 1;")]);
        let stale = fx.store.snapshot().await.unwrap();

        // Another runner already applied version 1 after `stale` was read.
        let mut advanced = stale.clone();
        advanced.version = 1;
        advanced.hash = fx.migrations[0].hash.clone();
        advanced.file = fx.migrations[0].file_name();
        fx.store.set_state(advanced.clone()).await;

        let failure = fx.runner.run(&stale, fx.migrations).await.unwrap_err();

        assert_eq!(
            failure.status,
            MigrationStatus { applied: 0, failed: 1, skipped: 0, latest: 0 }
        );
        assert_eq!(failure.error.stage(), Some(StepStage::Begin));
        assert!(failure.error.is_concurrent_conflict());
        match failure.error {
            MigrationError::Step { source, .. } => {
                assert!(matches!(*source, MigrationError::CheckpointMoved { version: 1 }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fx.executor.executed().await.is_empty());
        assert_eq!(fx.store.snapshot().await.unwrap(), advanced);
    }

    #[tokio::test]
    async fn test_file_edited_after_discovery_is_not_run() {
        let fx = fixture(&[(1, "SELECT 1;")]);
        fs::write(&fx.migrations[0].file, "DROP TABLE users;").unwrap();
        let state = fx.store.snapshot().await.unwrap();

        let failure = fx.runner.run(&state, fx.migrations).await.unwrap_err();

        match failure.error {
            MigrationError::Step { stage, source, .. } => {
                assert_eq!(stage, StepStage::Apply);
                assert!(matches!(*source, MigrationError::Drift { version: 1, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fx.executor.executed().await.is_empty());
    }
}
