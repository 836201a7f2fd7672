//! In-memory collaborators for exercising the engine without a database
//!
//! [`MemoryVersionStore`] follows the same guarded-write rules as the
//! PostgreSQL store; [`MemoryExecutor`] records scripts instead of running
//! them. Both can be told to fail on demand.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::definitions::{Migration, PersistedState};
use super::executor::ScriptExecutor;
use super::store::VersionStore;
use crate::error::{MigrationError, MigrationResult, StepStage};

fn injected(what: String) -> MigrationError {
    MigrationError::Database(sqlx::Error::Protocol(what))
}

/// [`VersionStore`] holding the tracked row in process memory
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    state: Mutex<Option<PersistedState>>,
    failures: Mutex<Vec<(StepStage, u64)>>,
    not_found_reads: AtomicUsize,
}

impl MemoryVersionStore {
    /// A store with no tracked row, like a database never migrated
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    /// Fail the next `begin_step` or `complete_step` for `version`.
    /// [`StepStage::Apply`] is ignored; script failures belong to the
    /// executor.
    pub async fn fail_on(&self, stage: StepStage, version: u64) {
        self.failures.lock().await.push((stage, version));
    }

    /// The tracked row as it currently stands
    pub async fn snapshot(&self) -> Option<PersistedState> {
        self.state.lock().await.clone()
    }

    /// Overwrite the row, as an operator editing it by hand would
    pub async fn set_state(&self, state: PersistedState) {
        *self.state.lock().await = Some(state);
    }

    /// How many reads found no row
    pub fn not_found_reads(&self) -> usize {
        self.not_found_reads.load(Ordering::SeqCst)
    }

    async fn take_failure(&self, stage: StepStage, version: u64) -> bool {
        let mut failures = self.failures.lock().await;
        match failures.iter().position(|f| *f == (stage, version)) {
            Some(index) => {
                failures.remove(index);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn current(&self) -> MigrationResult<Option<PersistedState>> {
        let state = self.state.lock().await.clone();
        if state.is_none() {
            self.not_found_reads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(state)
    }

    async fn bootstrap(&self) -> MigrationResult<PersistedState> {
        let mut state = self.state.lock().await;
        Ok(state
            .get_or_insert_with(|| PersistedState::bootstrap(Utc::now()))
            .clone())
    }

    async fn begin_step(&self, migration: &Migration) -> MigrationResult<()> {
        if self.take_failure(StepStage::Begin, migration.version).await {
            return Err(injected(format!(
                "injected begin failure for version {}",
                migration.version
            )));
        }

        let mut guard = self.state.lock().await;
        match guard.as_mut() {
            Some(state) if state.complete && state.version < migration.version => {
                state.version = migration.version;
                state.hash = migration.hash.clone();
                state.file = migration.file_name();
                state.last_run = Utc::now();
                state.complete = false;
                Ok(())
            }
            _ => Err(MigrationError::CheckpointMoved {
                version: migration.version,
            }),
        }
    }

    async fn complete_step(&self, version: u64) -> MigrationResult<()> {
        if self.take_failure(StepStage::Complete, version).await {
            return Err(injected(format!(
                "injected complete failure for version {}",
                version
            )));
        }

        let mut guard = self.state.lock().await;
        match guard.as_mut() {
            Some(state) if state.version == version && !state.complete => {
                state.complete = true;
                state.last_run = Utc::now();
                Ok(())
            }
            _ => Err(MigrationError::CheckpointMoved { version }),
        }
    }

    async fn resolve(&self, version: u64) -> MigrationResult<PersistedState> {
        let mut guard = self.state.lock().await;
        match guard.as_mut() {
            Some(state) if state.version == version && !state.complete => {
                state.complete = true;
                state.last_run = Utc::now();
                Ok(state.clone())
            }
            Some(state) => Err(MigrationError::NotResolvable {
                version,
                current: state.version,
                complete: state.complete,
            }),
            None => Err(MigrationError::NotResolvable {
                version,
                current: 0,
                complete: true,
            }),
        }
    }
}

/// [`ScriptExecutor`] that records scripts instead of running them
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    executed: Mutex<Vec<String>>,
    fail_markers: Mutex<Vec<String>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any script containing `marker`
    pub async fn fail_when_contains(&self, marker: impl Into<String>) {
        self.fail_markers.lock().await.push(marker.into());
    }

    /// Scripts executed successfully, in order
    pub async fn executed(&self) -> Vec<String> {
        self.executed.lock().await.clone()
    }
}

#[async_trait]
impl ScriptExecutor for MemoryExecutor {
    async fn execute_script(&self, sql: &str) -> MigrationResult<()> {
        let markers = self.fail_markers.lock().await;
        if let Some(marker) = markers.iter().find(|m| sql.contains(m.as_str())) {
            return Err(MigrationError::Script {
                statement: 0,
                source: sqlx::Error::Protocol(format!("script contains '{}'", marker)),
            });
        }
        drop(markers);

        self.executed.lock().await.push(sql.to_string());
        Ok(())
    }
}
