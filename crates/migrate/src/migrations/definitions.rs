//! Migration Definitions - Core types shared by every stage of a run
//!
//! Defines the discovered [`Migration`], the persisted [`PersistedState`]
//! checkpoint, and the per-run [`MigrationStatus`] tally.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single numbered migration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Version parsed from the file name; defines the apply order
    pub version: u64,
    /// Path to the SQL script
    pub file: PathBuf,
    /// Hex SHA-256 digest of the file contents
    pub hash: String,
    /// Whether this version has already been applied
    pub complete: bool,
    /// Last state transition, when known
    pub last_run: Option<DateTime<Utc>>,
}

impl Migration {
    /// A freshly discovered migration, not yet classified
    pub fn new(version: u64, file: impl Into<PathBuf>, hash: impl Into<String>) -> Self {
        Self {
            version,
            file: file.into(),
            hash: hash.into(),
            complete: false,
            last_run: None,
        }
    }

    /// The file path as stored in the version row
    pub fn file_name(&self) -> String {
        self.file.to_string_lossy().into_owned()
    }
}

/// The single tracked row in `db_version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Highest version the database claims to have reached
    pub version: u64,
    pub hash: String,
    pub file: String,
    pub last_run: DateTime<Utc>,
    /// False while a migration is in flight or after one failed
    pub complete: bool,
}

impl PersistedState {
    /// The row written on first contact with a fresh database
    pub fn bootstrap(now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            hash: String::new(),
            file: String::new(),
            last_run: now,
            complete: true,
        }
    }
}

/// Outcome counts for one runner invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub applied: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Highest version known complete at the end of the run
    pub latest: u64,
}

impl MigrationStatus {
    /// Fresh tally starting from the persisted checkpoint
    pub fn starting_at(latest: u64) -> Self {
        Self {
            latest,
            ..Self::default()
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "applied: {}, skipped: {}, failed: {}, latest: {}",
            self.applied, self.skipped, self.failed, self.latest
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_state() {
        let state = PersistedState::bootstrap(Utc::now());
        assert_eq!(state.version, 0);
        assert!(state.complete);
        assert!(state.hash.is_empty());
        assert!(state.file.is_empty());
    }

    #[test]
    fn test_status_display() {
        let status = MigrationStatus {
            applied: 2,
            failed: 0,
            skipped: 1,
            latest: 3,
        };
        assert_eq!(status.to_string(), "applied: 2, skipped: 1, failed: 0, latest: 3");
        assert_eq!(MigrationStatus::starting_at(5).latest, 5);
    }
}
