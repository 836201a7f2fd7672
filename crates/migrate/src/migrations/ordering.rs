//! Numeric ordering of migrations
//!
//! Version number is the only sequencing rule; there is no dependency graph.

use super::definitions::Migration;

/// Sort migrations into ascending version order.
///
/// Versions are assumed unique (discovery rejects duplicates), so the
/// result is strictly ascending.
pub fn sort_migrations(migrations: &mut [Migration]) {
    migrations.sort_unstable_by_key(|migration| migration.version);
}

/// Whether `migrations` is strictly ascending by version
pub fn is_strictly_ascending(migrations: &[Migration]) -> bool {
    migrations
        .windows(2)
        .all(|pair| pair[0].version < pair[1].version)
}
