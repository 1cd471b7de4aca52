//! Lightweight migration runner for rusqlite.
//!
//! Numbered SQL files live in `migrations/` and are embedded at compile
//! time. Applied versions are tracked in `schema_versions`; any pending
//! migrations run in order when the database is opened.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::info;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered by version.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "001_initial",
    sql: include_str!("../migrations/001_initial.sql"),
}];

/// Run all pending migrations against the given connection.
///
/// Returns the number of migrations applied by this call.
pub fn run_migrations(conn: &mut Connection) -> Result<usize, rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut pending = 0;
    for migration in MIGRATIONS.iter().filter(|m| !applied.contains(&m.version)) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
        pending += 1;
    }

    info!(
        component = "migrations",
        event = "migrations.complete",
        total = MIGRATIONS.len(),
        applied = pending,
        skipped = MIGRATIONS.len() - pending,
        "Migration check complete"
    );

    Ok(pending)
}

/// Extract numeric version prefix from a migration name like "001_initial".
#[cfg(test)]
fn parse_version(name: &str) -> Option<i64> {
    name.split('_').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_names_match_their_versions() {
        for m in MIGRATIONS {
            assert_eq!(parse_version(m.name), Some(m.version), "bad name {}", m.name);
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&mut conn).unwrap(), MIGRATIONS.len());
        assert_eq!(run_migrations(&mut conn).unwrap(), 0);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('identity_records', 'scheduled_tasks', 'task_queue')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
