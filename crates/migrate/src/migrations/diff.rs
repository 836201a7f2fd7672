//! Reconciliation of discovered migrations against the persisted checkpoint

use super::definitions::{Migration, PersistedState};
use crate::error::{MigrationError, MigrationResult};

/// How a hash mismatch on the current checkpoint is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriftPolicy {
    /// Refuse to continue
    #[default]
    Reject,
    /// Log a warning and continue. Set through `allow_drift`.
    Allow,
}

impl DriftPolicy {
    pub fn from_allow_drift(allow_drift: bool) -> Self {
        if allow_drift {
            DriftPolicy::Allow
        } else {
            DriftPolicy::Reject
        }
    }
}

/// Classify each candidate as applied (`complete = true`) or pending.
///
/// Fails if the checkpoint is still marked incomplete from an earlier run,
/// or if the file at the checkpoint's version no longer hashes to what was
/// recorded when it was applied.
pub fn diff_migrations(
    state: &PersistedState,
    candidates: Vec<Migration>,
    policy: DriftPolicy,
) -> MigrationResult<Vec<Migration>> {
    if !state.complete {
        return Err(MigrationError::UnresolvedFailure {
            version: state.version,
            file: state.file.clone(),
        });
    }

    let mut classified = Vec::with_capacity(candidates.len());
    for mut migration in candidates {
        if migration.version == state.version && migration.hash != state.hash {
            match policy {
                DriftPolicy::Reject => {
                    return Err(MigrationError::Drift {
                        version: migration.version,
                        file: migration.file,
                        recorded: state.hash.clone(),
                        found: migration.hash,
                    });
                }
                DriftPolicy::Allow => {
                    tracing::warn!(
                        version = migration.version,
                        file = %migration.file.display(),
                        recorded = %state.hash,
                        found = %migration.hash,
                        "applied migration was modified; continuing because allow_drift is set"
                    );
                }
            }
        }

        migration.complete = migration.version <= state.version;
        classified.push(migration);
    }

    Ok(classified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state(version: u64, hash: &str, complete: bool) -> PersistedState {
        PersistedState {
            version,
            hash: hash.to_string(),
            file: format!("migrations/{version}.sql"),
            last_run: Utc::now(),
            complete,
        }
    }

    fn candidate(version: u64, hash: &str) -> Migration {
        Migration::new(version, format!("migrations/{version}.sql"), hash)
    }

    #[test]
    fn test_classifies_applied_and_pending() {
        let candidates = vec![candidate(1, "a"), candidate(2, "b"), candidate(3, "c")];
        let classified =
            diff_migrations(&state(1, "a", true), candidates, DriftPolicy::Reject).unwrap();

        let flags: Vec<(u64, bool)> = classified.iter().map(|m| (m.version, m.complete)).collect();
        assert_eq!(flags, vec![(1, true), (2, false), (3, false)]);
    }

    #[test]
    fn test_modified_checkpoint_file_is_drift() {
        let err = diff_migrations(
            &state(3, "A", true),
            vec![candidate(3, "B")],
            DriftPolicy::Reject,
        )
        .unwrap_err();

        match err {
            MigrationError::Drift {
                version,
                recorded,
                found,
                ..
            } => {
                assert_eq!(version, 3);
                assert_eq!(recorded, "A");
                assert_eq!(found, "B");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_only_checkpoint_version_is_hash_checked() {
        let candidates = vec![candidate(1, "edited"), candidate(2, "b")];
        let classified =
            diff_migrations(&state(2, "b", true), candidates, DriftPolicy::Reject).unwrap();
        assert!(classified.iter().all(|m| m.complete));
    }

    #[test]
    fn test_allow_drift_downgrades_to_warning() {
        let classified = diff_migrations(
            &state(3, "A", true),
            vec![candidate(3, "B"), candidate(4, "D")],
            DriftPolicy::from_allow_drift(true),
        )
        .unwrap();
        assert!(classified[0].complete);
        assert!(!classified[1].complete);
    }

    #[test]
    fn test_incomplete_checkpoint_blocks_diff() {
        let err = diff_migrations(
            &state(2, "b", false),
            vec![candidate(2, "b"), candidate(3, "c")],
            DriftPolicy::Reject,
        )
        .unwrap_err();

        match err {
            MigrationError::UnresolvedFailure { version, file } => {
                assert_eq!(version, 2);
                assert_eq!(file, "migrations/2.sql");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_fresh_database_leaves_everything_pending() {
        let classified = diff_migrations(
            &PersistedState::bootstrap(Utc::now()),
            vec![candidate(1, "a"), candidate(2, "b")],
            DriftPolicy::Reject,
        )
        .unwrap();
        assert!(classified.iter().all(|m| !m.complete));
    }
}
