//! Schema versioning for the bus tables.
//!
//! Each step is a SQL file compiled into the binary. Applied steps are
//! recorded by name in `_databus_migrations`; a step and its record commit
//! together, so a crash mid-step leaves it unapplied.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

struct Step {
    name: &'static str,
    sql: &'static str,
}

macro_rules! step {
    ($name:literal) => {
        Step {
            name: $name,
            sql: include_str!(concat!("migrations/", $name, ".sql")),
        }
    };
}

/// Ordered schema history. Append only.
const SCHEMA: &[Step] = &[
    step!("000_subscriptions"),
    step!("001_events"),
    step!("002_mutations"),
    step!("003_jobs"),
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    #[error("failed to read applied migrations: {0}")]
    StateQuery(rusqlite::Error),
}

/// Brings the schema up to date and returns how many steps this call
/// applied. Safe to run on every start.
///
/// # Errors
///
/// `MigrationError::ExecutionFailed` names the step that failed; everything
/// before it stays applied.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply_steps(conn, SCHEMA)
}

fn apply_steps(conn: &Connection, steps: &[Step]) -> Result<usize, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _databus_migrations (
            name TEXT PRIMARY KEY,
            applied_at_ms INTEGER NOT NULL
        );",
    )
    .map_err(|source| MigrationError::ExecutionFailed {
        name: "_databus_migrations".to_string(),
        source,
    })?;

    let done = applied_names(conn).map_err(MigrationError::StateQuery)?;
    let pending: Vec<&Step> = steps.iter().filter(|s| !done.contains(s.name)).collect();
    if pending.is_empty() {
        tracing::debug!(applied = done.len(), "schema up to date");
        return Ok(0);
    }

    for step in &pending {
        tracing::info!(migration = step.name, "applying migration");
        apply_one(conn, step).map_err(|source| MigrationError::ExecutionFailed {
            name: step.name.to_string(),
            source,
        })?;
    }
    Ok(pending.len())
}

fn applied_names(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM _databus_migrations")?;
    let names = stmt.query_map([], |row| row.get(0))?;
    names.collect()
}

fn apply_one(conn: &Connection, step: &Step) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(step.sql)?;
    tx.execute(
        "INSERT INTO _databus_migrations (name, applied_at_ms)
         VALUES (?1, CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER))",
        [step.name],
    )?;
    tx.commit()
}
