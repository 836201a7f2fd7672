//! Migrator - the full discover, diff and run pipeline

use std::path::PathBuf;
use std::sync::Arc;

use super::definitions::{Migration, MigrationStatus, PersistedState};
use super::diff::{diff_migrations, DriftPolicy};
use super::discovery::MigrationManager;
use super::executor::ScriptExecutor;
use super::runner::{MigrationRunner, RunFailure};
use super::store::{ensure_state, VersionStore};
use crate::config::MigrationConfig;
use crate::database::Database;
use crate::error::MigrationResult;

/// Reconciled view of the migrations directory against the database
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub state: PersistedState,
    /// Every discovered migration in ascending order, classified
    pub migrations: Vec<Migration>,
}

impl MigrationPlan {
    pub fn pending(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().filter(|m| !m.complete)
    }

    pub fn applied(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().filter(|m| m.complete)
    }

    pub fn is_up_to_date(&self) -> bool {
        self.pending().next().is_none()
    }
}

/// Entry point tying discovery, the version store and the runner together
#[derive(Clone)]
pub struct Migrator {
    manager: MigrationManager,
    store: Arc<dyn VersionStore>,
    runner: MigrationRunner,
}

impl Migrator {
    pub fn new(
        config: MigrationConfig,
        store: Arc<dyn VersionStore>,
        executor: Arc<dyn ScriptExecutor>,
    ) -> Self {
        Self {
            manager: MigrationManager::with_config(config),
            runner: MigrationRunner::new(store.clone(), executor),
            store,
        }
    }

    /// Migrator over a connected PostgreSQL database
    pub fn for_database(database: &Database, config: MigrationConfig) -> Self {
        Self::new(
            config,
            Arc::new(database.version_store()),
            Arc::new(database.script_executor()),
        )
    }

    pub fn config(&self) -> &MigrationConfig {
        self.manager.config()
    }

    /// Read the checkpoint and classify every migration on disk, without
    /// changing anything.
    pub async fn plan(&self) -> MigrationResult<MigrationPlan> {
        let state = ensure_state(self.store.as_ref()).await?;
        self.plan_from(state).await
    }

    async fn plan_from(&self, state: PersistedState) -> MigrationResult<MigrationPlan> {
        let discovered = self.manager.discover().await?;
        let policy = DriftPolicy::from_allow_drift(self.config().allow_drift);
        let migrations = diff_migrations(&state, discovered, policy)?;
        Ok(MigrationPlan { state, migrations })
    }

    /// Apply every pending migration.
    ///
    /// Errors raised before the first migration starts (bootstrap,
    /// discovery, diff) come back with an empty tally.
    pub async fn migrate(&self) -> Result<MigrationStatus, RunFailure> {
        let state = ensure_state(self.store.as_ref())
            .await
            .map_err(|error| RunFailure {
                status: MigrationStatus::default(),
                error,
            })?;
        let start = MigrationStatus::starting_at(state.version);

        let plan = self.plan_from(state).await.map_err(|error| RunFailure {
            status: start,
            error,
        })?;

        tracing::info!(
            current = plan.state.version,
            pending = plan.pending().count(),
            "starting migrations"
        );
        self.runner.run(&plan.state, plan.migrations).await
    }

    /// Clear a failed checkpoint after a manual fix
    pub async fn resolve(&self, version: u64) -> MigrationResult<PersistedState> {
        self.store.resolve(version).await
    }

    /// Create the next numbered migration file
    pub async fn create(&self, name: &str) -> MigrationResult<PathBuf> {
        self.manager.create_migration(name).await
    }
}
