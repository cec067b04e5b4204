//! Versioned SQLite schema support shared by every store in the crate.

mod versioned_schema;

pub use versioned_schema::*;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

/// Open (or create) a database whose layout is described by `schemas`.
///
/// A fresh file is created with the latest schema. An existing file must carry a
/// known `user_version`, must validate against that version's tables, and is then
/// migrated forward one version at a time inside a single transaction.
pub fn open_versioned_database<P: AsRef<Path>>(
    db_path: P,
    schemas: &'static [VersionedSchema],
    label: &str,
) -> Result<Connection> {
    let path = db_path.as_ref();
    let is_new_db = !path.exists();

    let mut conn = Connection::open(path)
        .with_context(|| format!("Failed to open {} database at {:?}", label, path))?;
    conn.execute("PRAGMA foreign_keys = ON;", [])?;

    let latest = schemas
        .last()
        .with_context(|| format!("No schema versions declared for {} database", label))?;

    if is_new_db {
        info!("Creating new {} database at {:?}", label, path);
        latest.create(&conn)?;
        return Ok(conn);
    }

    let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let db_version = raw_version - BASE_DB_VERSION as i64;
    if db_version < 1 {
        anyhow::bail!(
            "{} database version {} is invalid (expected >= 1)",
            label,
            db_version
        );
    }

    let version_index = schemas
        .iter()
        .position(|s| s.version as i64 == db_version)
        .with_context(|| format!("Unknown {} database version {}", label, db_version))?;
    schemas[version_index].validate(&conn).with_context(|| {
        format!(
            "{} database schema validation failed for version {}",
            label, db_version
        )
    })?;

    if (db_version as usize) < latest.version {
        info!(
            "Migrating {} database from version {} to {}",
            label, db_version, latest.version
        );
        let tx = conn.transaction()?;
        let from_version = db_version as usize;
        let mut reached = from_version;
        for schema in schemas.iter().filter(|s| s.version > from_version) {
            if let Some(migration_fn) = schema.migration {
                migration_fn(&tx).with_context(|| {
                    format!("Failed to run {} migration to version {}", label, schema.version)
                })?;
            }
            reached = schema.version;
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + reached),
            [],
        )?;
        tx.commit()?;
    }

    Ok(conn)
}
