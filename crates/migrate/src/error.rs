//! Error types for the migration engine
//!
//! Every failure surfaces to the caller with the version, file and
//! underlying cause attached. Nothing is retried automatically.

use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::database::PoolError;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// The transition of a single migration that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStage {
    /// Writing the `complete = false` checkpoint before the SQL runs
    Begin,
    /// Executing the migration script itself
    Apply,
    /// Flipping the checkpoint back to `complete = true`
    Complete,
}

impl fmt::Display for StepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            StepStage::Begin => "start",
            StepStage::Apply => "apply",
            StepStage::Complete => "complete",
        };
        write!(f, "{}", stage)
    }
}

/// Error types for migration operations
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bootstrap migration state: {0}")]
    Bootstrap(#[source] Box<MigrationError>),

    #[error("Invalid migration version in file name {}: {source}", .file.display())]
    InvalidVersion {
        file: PathBuf,
        #[source]
        source: ParseIntError,
    },

    #[error(
        "Migration version {version} is claimed by both {} and {}",
        .first.display(),
        .second.display()
    )]
    DuplicateVersion {
        version: u64,
        first: PathBuf,
        second: PathBuf,
    },

    #[error(
        "Migrations are up to date but version {version} ({}) appears to have been modified: recorded hash {recorded}, found {found}",
        .file.display()
    )]
    Drift {
        version: u64,
        file: PathBuf,
        recorded: String,
        found: String,
    },

    #[error("Migration {version} in file {file} appears to have failed, please rectify manually")]
    UnresolvedFailure { version: u64, file: String },

    #[error("Failed to {stage} migration {version} ({}): {source}", .file.display())]
    Step {
        stage: StepStage,
        version: u64,
        file: PathBuf,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Version checkpoint moved while handling migration {version}; another runner may be active")]
    CheckpointMoved { version: u64 },

    #[error("Cannot resolve migration {version}: checkpoint is at version {current} (complete: {complete})")]
    NotResolvable {
        version: u64,
        current: u64,
        complete: bool,
    },

    #[error("Failed to execute statement {statement} of migration script: {source}")]
    Script {
        statement: usize,
        #[source]
        source: sqlx::Error,
    },
}

impl MigrationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn step(
        stage: StepStage,
        version: u64,
        file: impl Into<PathBuf>,
        source: MigrationError,
    ) -> Self {
        Self::Step {
            stage,
            version,
            file: file.into(),
            source: Box::new(source),
        }
    }

    /// The stage a step error was raised in, if this is one
    pub fn stage(&self) -> Option<StepStage> {
        match self {
            Self::Step { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether the error came from another runner touching the tracked row
    /// at the same time: a moved checkpoint, or a PostgreSQL
    /// serialization failure (40001) or deadlock (40P01).
    pub fn is_concurrent_conflict(&self) -> bool {
        match self {
            Self::CheckpointMoved { .. } => true,
            Self::Step { source, .. } | Self::Bootstrap(source) => source.is_concurrent_conflict(),
            Self::Database(err) | Self::Script { source: err, .. } => err
                .as_database_error()
                .and_then(|db| db.code())
                .map_or(false, |code| code == "40001" || code == "40P01"),
            _ => false,
        }
    }
}
