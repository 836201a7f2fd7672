//! Migration Discovery - File system side of the migration engine
//!
//! Scans the migrations directory for `<version>.sql` files, hashes their
//! contents, and creates new numbered files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use md5::{Digest, Md5};
use tokio::fs;

use super::definitions::Migration;
use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};

const MIGRATION_EXTENSION: &str = "sql";

/// Loads and creates migration files
#[derive(Debug, Clone)]
pub struct MigrationManager {
    config: MigrationConfig,
}

impl MigrationManager {
    /// Create a new migration manager with default configuration
    pub fn new() -> Self {
        Self::with_config(MigrationConfig::default())
    }

    /// Create a new migration manager with custom configuration
    pub fn with_config(config: MigrationConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Discover every migration file directly inside the migrations
    /// directory, in ascending version order.
    ///
    /// Sub-directories and files without a `.sql` extension are ignored.
    /// A `.sql` file whose stem is not a base-10 integer, or two files
    /// sharing a version, abort discovery. A missing directory holds no
    /// migrations.
    pub async fn discover(&self) -> MigrationResult<Vec<Migration>> {
        let dir = &self.config.migrations_dir;
        if !fs::try_exists(dir)
            .await
            .map_err(|e| MigrationError::io(dir, e))?
        {
            tracing::debug!(dir = %dir.display(), "migrations directory does not exist");
            return Ok(Vec::new());
        }

        let mut found: BTreeMap<u64, Migration> = BTreeMap::new();
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| MigrationError::io(dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MigrationError::io(dir, e))?
        {
            let path = entry.path();
            let metadata = fs::metadata(&path)
                .await
                .map_err(|e| MigrationError::io(&path, e))?;
            if !metadata.is_file() || !is_migration_file(&path) {
                continue;
            }

            let version = parse_version(&path)?;
            if let Some(existing) = found.get(&version) {
                let (first, second) = ordered_pair(&existing.file, &path);
                return Err(MigrationError::DuplicateVersion {
                    version,
                    first,
                    second,
                });
            }

            let contents = fs::read(&path)
                .await
                .map_err(|e| MigrationError::io(&path, e))?;
            found.insert(version, Migration::new(version, path, hash_contents(&contents)));
        }

        tracing::debug!(dir = %dir.display(), count = found.len(), "discovered migrations");
        Ok(found.into_values().collect())
    }

    /// Write an empty migration numbered one past the highest existing
    /// version and return its path.
    pub async fn create_migration(&self, name: &str) -> MigrationResult<PathBuf> {
        let dir = &self.config.migrations_dir;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| MigrationError::io(dir, e))?;

        let next_version = self
            .discover()
            .await?
            .last()
            .map_or(1, |latest| latest.version + 1);

        let path = dir.join(format!("{}.{}", next_version, MIGRATION_EXTENSION));
        let template = format!(
            "-- Migration {}: {}\n-- Created: {}\n\n",
            next_version,
            name.trim(),
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );

        fs::write(&path, template)
            .await
            .map_err(|e| MigrationError::io(&path, e))?;

        tracing::info!(version = next_version, file = %path.display(), "created migration");
        Ok(path)
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase hex MD5 digest of a migration's contents, the format stored
/// in `db_version.hash`
pub fn hash_contents(contents: &[u8]) -> String {
    hex::encode(Md5::digest(contents))
}

/// Parse the version out of a `<version>.sql` path
pub fn parse_version(path: &Path) -> MigrationResult<u64> {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();

    stem.parse::<u64>()
        .map_err(|source| MigrationError::InvalidVersion {
            file: path.to_path_buf(),
            source,
        })
}

fn is_migration_file(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext == MIGRATION_EXTENSION)
}

// Directory iteration order is platform dependent; keep error text stable.
fn ordered_pair(a: &Path, b: &Path) -> (PathBuf, PathBuf) {
    if a <= b {
        (a.to_path_buf(), b.to_path_buf())
    } else {
        (b.to_path_buf(), a.to_path_buf())
    }
}
