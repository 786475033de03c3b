//! Schema migrations for the program ledger.
//!
//! Applied versions are recorded in `schema_migrations`. Each pending step
//! runs in its own transaction together with its bookkeeping row, so a
//! failed step leaves neither a half-built schema nor a false record.

use std::collections::BTreeSet;

use rusqlite::Connection;

use super::error::DatabaseError;

struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
    /// Column the step adds; the step is recorded without running when the
    /// column is already there.
    adds_column: Option<(&'static str, &'static str)>,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "create_machine_programs",
        sql: include_str!("sql/001_create_machine_programs.sql"),
        adds_column: None,
    },
    Step {
        version: 2,
        name: "add_program_version",
        sql: include_str!("sql/002_add_program_version.sql"),
        adds_column: Some(("machine_programs", "version")),
    },
    Step {
        version: 3,
        name: "index_machine_status",
        sql: include_str!("sql/003_index_machine_status.sql"),
        adds_column: None,
    },
];

/// Brings the schema up to date.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )?;

    let applied = applied_versions(conn)?;

    for step in STEPS.iter().filter(|s| !applied.contains(&s.version)) {
        let skip = match step.adds_column {
            Some((table, column)) => column_exists(conn, table, column)?,
            None => false,
        };

        let tx = conn.unchecked_transaction()?;
        if skip {
            log::info!("Schema v{} ({}) already present", step.version, step.name);
        } else {
            log::info!("Applying schema v{} ({})", step.version, step.name);
            tx.execute_batch(step.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: step.version,
                    reason: e.to_string(),
                })?;
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![step.version, step.name, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
    }

    Ok(())
}

/// Highest applied schema version, 0 for an empty database.
pub fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(applied_versions(conn)?.last().copied().unwrap_or(0))
}

fn applied_versions(conn: &Connection) -> Result<BTreeSet<u32>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let versions = stmt
        .query_map([], |r| r.get::<_, u32>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(versions)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    let mut stmt = conn.prepare("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")?;
    Ok(stmt.exists(rusqlite::params![table, column])?)
}
