//! Database migration system.
//!
//! The schema version lives in the `global_settings` singleton row.
//! Migrations are forward-only; each one runs inside its own transaction.
//! Opening a database written by a newer release fails rather than
//! guessing at an unknown schema.

use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

/// Current schema version.
pub const SCHEMA_VERSION: u64 = 1;

/// Run all pending migrations.
pub fn run(conn: &mut Connection) -> Result<()> {
    let current = current_version(conn)?;

    match current {
        None => {
            tracing::info!("initializing database schema v{SCHEMA_VERSION}");
            let tx = conn.transaction()?;
            tx.execute_batch(crate::schema::SCHEMA_V1)?;
            tx.execute(
                "INSERT INTO global_settings (id, db_version) VALUES (1, ?1)",
                [SCHEMA_VERSION as i64],
            )?;
            tx.commit()?;
        }
        Some(version) if version < SCHEMA_VERSION => {
            for target in (version + 1)..=SCHEMA_VERSION {
                tracing::info!("running migration to v{target}");
                let tx = conn.transaction()?;
                apply_migration(&tx, target)?;
                tx.execute(
                    "UPDATE global_settings SET db_version=?1",
                    [target as i64],
                )?;
                tx.commit()?;
            }
        }
        Some(version) if version > SCHEMA_VERSION => {
            return Err(Error::FutureVersion {
                version,
                supported: SCHEMA_VERSION,
            });
        }
        Some(_) => {}
    }

    Ok(())
}

/// Read the schema version, or `None` for a fresh database.
fn current_version(conn: &Connection) -> Result<Option<u64>> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='global_settings'",
        [],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Ok(None);
    }
    let version: Option<i64> = conn
        .query_row("SELECT db_version FROM global_settings WHERE id=1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.map(|v| v as u64))
}

/// Apply a specific migration inside the caller's transaction.
fn apply_migration(_tx: &rusqlite::Transaction<'_>, version: u64) -> Result<()> {
    match version {
        // Future migrations go here:
        // 2 => migration_v2(tx),
        _ => Err(Error::Migration(format!(
            "unknown migration version: {version}"
        ))),
    }
}
