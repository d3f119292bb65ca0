//! Schema migrations, tracked with `PRAGMA user_version`.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Every schema step in order. Entry `n` moves the schema to version `n + 1`.
const STEPS: &[(&str, Step)] = &[("v001_initial", v001_initial::up)];

pub fn schema_version() -> u32 {
    STEPS.len() as u32
}

/// Bring the schema up to [`schema_version`], one transaction per step.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target = schema_version();

    if current > target {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than this build (v{target})"
        )));
    }
    if current == target {
        tracing::debug!(version = current, "Schema up to date");
        return Ok(());
    }

    for (index, (name, step)) in STEPS.iter().enumerate().skip(current as usize) {
        let version = index as u32 + 1;
        tracing::info!(migration = *name, version, "Applying migration");

        let tx = conn.unchecked_transaction()?;
        step(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}
