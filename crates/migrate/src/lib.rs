//! # dbver-migrate
//!
//! Ordered, file-based schema migrations for PostgreSQL, tracked through a
//! single `db_version` row.
//!
//! ```rust,no_run
//! use dbver_migrate::{Database, DatabaseConfig, MigrationConfig, Migrator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let database = Database::connect(&DatabaseConfig::from_env()?).await?;
//! let migrator = Migrator::for_database(&database, MigrationConfig::from_env()?);
//!
//! let status = migrator.migrate().await?;
//! println!("{status}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod migrations;
pub mod transaction;

pub use config::{ConfigError, DatabaseConfig, MigrationConfig};
pub use database::{Database, PoolError};
pub use error::{MigrationError, MigrationResult, StepStage};
pub use migrations::*;
