//! End-to-end runs of the migrator over in-memory collaborators

use std::fs;
use std::sync::Arc;

use chrono::Utc;
use dbver_migrate::{
    hash_contents, MemoryExecutor, MemoryVersionStore, MigrationConfig, MigrationError,
    MigrationStatus, Migrator, PersistedState, StepStage, VersionStore,
};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    store: Arc<MemoryVersionStore>,
    executor: Arc<MemoryExecutor>,
    migrator: Migrator,
}

impl Harness {
    fn new(store: MemoryVersionStore) -> Self {
        Self::with_config(store, |config| config)
    }

    fn with_config(
        store: MemoryVersionStore,
        configure: impl FnOnce(MigrationConfig) -> MigrationConfig,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store);
        let executor = Arc::new(MemoryExecutor::new());
        let migrator = Migrator::new(
            configure(MigrationConfig::new(dir.path())),
            store.clone(),
            executor.clone(),
        );
        Self {
            dir,
            store,
            executor,
            migrator,
        }
    }

    fn write(&self, version: u64, sql: &str) {
        fs::write(self.dir.path().join(format!("{version}.sql")), sql).unwrap();
    }

    fn state_at(&self, version: u64, sql: &str) -> PersistedState {
        PersistedState {
            version,
            hash: hash_contents(sql.as_bytes()),
            file: self
                .dir
                .path()
                .join(format!("{version}.sql"))
                .to_string_lossy()
                .into_owned(),
            last_run: Utc::now(),
            complete: true,
        }
    }
}

#[tokio::test]
async fn test_fresh_database_applies_everything() {
    let h = Harness::new(MemoryVersionStore::new());
    h.write(1, "CREATE TABLE users (id INT);");
    h.write(2, "CREATE TABLE posts (id INT);");

    let status = h.migrator.migrate().await.unwrap();

    assert_eq!(
        status,
        MigrationStatus { applied: 2, failed: 0, skipped: 0, latest: 2 }
    );
    assert_eq!(h.store.not_found_reads(), 1);
    let row = h.store.snapshot().await.unwrap();
    assert_eq!((row.version, row.complete), (2, true));
}

#[tokio::test]
async fn test_bootstrap_reports_not_found_once() {
    let h = Harness::new(MemoryVersionStore::new());

    let plan = h.migrator.plan().await.unwrap();
    assert_eq!(plan.state.version, 0);
    assert!(plan.state.complete);

    let state = h.store.current().await.unwrap().unwrap();
    assert_eq!((state.version, state.complete), (0, true));
    h.migrator.plan().await.unwrap();
    assert_eq!(h.store.not_found_reads(), 1);
}

#[tokio::test]
async fn test_partially_migrated_database() {
    let h = Harness::new(MemoryVersionStore::new());
    h.write(1, "CREATE TABLE a (id INT);");
    h.write(2, "CREATE TABLE b (id INT);");
    h.write(3, "CREATE TABLE c (id INT);");
    h.store.set_state(h.state_at(1, "CREATE TABLE a (id INT);")).await;

    let plan = h.migrator.plan().await.unwrap();
    let classified: Vec<(u64, bool)> = plan
        .migrations
        .iter()
        .map(|m| (m.version, m.complete))
        .collect();
    assert_eq!(classified, vec![(1, true), (2, false), (3, false)]);

    let status = h.migrator.migrate().await.unwrap();
    assert_eq!(
        status,
        MigrationStatus { applied: 2, failed: 0, skipped: 1, latest: 3 }
    );
    assert_eq!(
        h.executor.executed().await,
        vec!["CREATE TABLE b (id INT);", "CREATE TABLE c (id INT);"]
    );

    let row = h.store.snapshot().await.unwrap();
    assert_eq!((row.version, row.complete), (3, true));
    assert_eq!(row.hash, hash_contents(b"CREATE TABLE c (id INT);"));
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let h = Harness::new(MemoryVersionStore::new());
    h.write(1, "SELECT 1;");
    h.write(2, "SELECT 2;");
    h.write(3, "SELECT 3;");

    h.migrator.migrate().await.unwrap();
    let second = h.migrator.migrate().await.unwrap();

    assert_eq!(
        second,
        MigrationStatus { applied: 0, failed: 0, skipped: 3, latest: 3 }
    );
    assert_eq!(h.executor.executed().await.len(), 3);
    assert!(h.migrator.plan().await.unwrap().is_up_to_date());
}

#[tokio::test]
async fn test_fail_fast_then_resume_after_fix() {
    let h = Harness::new(MemoryVersionStore::new());
    h.write(1, "SELECT 1;");
    h.write(2, "SELECT broken;");
    h.write(3, "SELECT 3;");
    h.executor.fail_when_contains("broken").await;

    let failure = h.migrator.migrate().await.unwrap_err();
    assert_eq!(
        failure.status,
        MigrationStatus { applied: 1, failed: 1, skipped: 0, latest: 1 }
    );
    assert_eq!(failure.error.stage(), Some(StepStage::Apply));
    assert_eq!(h.executor.executed().await, vec!["SELECT 1;"]);

    let row = h.store.snapshot().await.unwrap();
    assert_eq!((row.version, row.complete), (2, false));

    // Every further attempt is refused until the row is corrected.
    for _ in 0..2 {
        let blocked = h.migrator.migrate().await.unwrap_err();
        assert!(matches!(
            blocked.error,
            MigrationError::UnresolvedFailure { version: 2, .. }
        ));
        assert_eq!(blocked.status.applied + blocked.status.failed, 0);
    }

    // An operator fixes the schema by hand, then clears the marker.
    h.write(2, "SELECT 2;");
    let mut fixed = h.store.snapshot().await.unwrap();
    fixed.hash = hash_contents(b"SELECT 2;");
    h.store.set_state(fixed).await;
    h.migrator.resolve(2).await.unwrap();

    let status = h.migrator.migrate().await.unwrap();
    assert_eq!(
        status,
        MigrationStatus { applied: 1, failed: 0, skipped: 2, latest: 3 }
    );
}

#[tokio::test]
async fn test_drift_on_checkpoint_is_fatal() {
    let h = Harness::new(MemoryVersionStore::new());
    h.write(1, "SELECT 1;");
    h.write(2, "SELECT 2;");
    h.migrator.migrate().await.unwrap();

    h.write(2, "SELECT 2; -- edited after the fact");
    h.write(3, "SELECT 3;");

    let failure = h.migrator.migrate().await.unwrap_err();
    assert!(matches!(
        failure.error,
        MigrationError::Drift { version: 2, .. }
    ));
    assert_eq!(failure.status, MigrationStatus::starting_at(2));
    assert_eq!(h.executor.executed().await.len(), 2);
}

#[tokio::test]
async fn test_allow_drift_flag_continues() {
    let h = Harness::with_config(MemoryVersionStore::new(), |config| {
        config.with_allow_drift(true)
    });
    h.write(1, "SELECT 1;");
    h.migrator.migrate().await.unwrap();

    h.write(1, "SELECT 1; -- reformatted");
    h.write(2, "SELECT 2;");

    let status = h.migrator.migrate().await.unwrap();
    assert_eq!(
        status,
        MigrationStatus { applied: 1, failed: 0, skipped: 1, latest: 2 }
    );
}

#[tokio::test]
async fn test_in_flight_checkpoint_blocks_other_runners() {
    let store = MemoryVersionStore::with_state(PersistedState::bootstrap(Utc::now()));
    let h = Harness::new(store);
    h.write(1, "SELECT 1;");

    // A second runner diffed against version 0 and began version 1 first.
    let plan = h.migrator.plan().await.unwrap();
    h.store.begin_step(&plan.migrations[0]).await.unwrap();

    let failure = h.migrator.migrate().await.unwrap_err();
    assert!(matches!(
        failure.error,
        MigrationError::UnresolvedFailure { version: 1, .. }
    ));
    assert!(h.executor.executed().await.is_empty());
}

#[tokio::test]
async fn test_create_then_migrate() {
    let h = Harness::new(MemoryVersionStore::new());
    h.write(1, "SELECT 1;");

    let created = h.migrator.create("add audit table").await.unwrap();
    assert_eq!(created, h.dir.path().join("2.sql"));

    let status = h.migrator.migrate().await.unwrap();
    assert_eq!(status.applied, 2);
    assert_eq!(status.latest, 2);
}
