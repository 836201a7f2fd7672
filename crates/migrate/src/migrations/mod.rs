//! Migration System
//!
//! Discovery reads `<version>.sql` files from disk, the differencer
//! classifies them against the persisted checkpoint, and the runner applies
//! what is pending in ascending version order.

pub mod definitions;
pub mod diff;
pub mod discovery;
pub mod executor;
pub mod memory;
pub mod migrator;
pub mod ordering;
pub mod runner;
pub mod store;

pub use definitions::{Migration, MigrationStatus, PersistedState};
pub use diff::{diff_migrations, DriftPolicy};
pub use discovery::{hash_contents, parse_version, MigrationManager};
pub use executor::{split_sql_statements, PgScriptExecutor, ScriptExecutor};
pub use memory::{MemoryExecutor, MemoryVersionStore};
pub use migrator::{MigrationPlan, Migrator};
pub use ordering::{is_strictly_ascending, sort_migrations};
pub use runner::{MigrationRunner, RunFailure};
pub use store::{ensure_state, PgVersionStore, VersionStore};
