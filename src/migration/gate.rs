//! Persisted schema version of a store.
//!
//! The version lives in two tables inside the store itself: `_schema_version`
//! (a single row holding the current version) and `_schema_history` (one row
//! per applied unit). Only the migration engine writes them, always inside the
//! transaction that runs the unit's script.

use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, Row, SqliteConnection};

/// `PRAGMA application_id` stamped on every store ("SHRD").
pub const STORE_APPLICATION_ID: i64 = 0x5348_5244;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub description: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaVersionRecord {
    pub current_version: i64,
    pub history: Vec<AppliedMigration>,
}

/// Stamps a fresh store and creates the version tables at version 0.
pub async fn initialize(conn: &mut SqliteConnection) -> Result<()> {
    let sql = format!(
        "PRAGMA application_id = {};
         CREATE TABLE IF NOT EXISTS _schema_version (
             id INTEGER PRIMARY KEY CHECK (id = 1),
             current_version INTEGER NOT NULL
         );
         INSERT OR IGNORE INTO _schema_version (id, current_version) VALUES (1, 0);
         CREATE TABLE IF NOT EXISTS _schema_history (
             version INTEGER PRIMARY KEY,
             description TEXT NOT NULL,
             checksum TEXT NOT NULL,
             applied_at TEXT NOT NULL
         );",
        STORE_APPLICATION_ID
    );
    (&mut *conn).execute(sqlx::raw_sql(&sql)).await?;
    Ok(())
}

/// Checks that the connection points at a store created by this system.
pub async fn identify(conn: &mut SqliteConnection, path: &str) -> Result<()> {
    let app_id: i64 = sqlx::query_scalar("PRAGMA application_id")
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| StoreError::invalid(path, e))?;
    if app_id != STORE_APPLICATION_ID {
        return Err(StoreError::invalid(
            path,
            format!("unexpected application id {:#x}", app_id),
        ));
    }

    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master
         WHERE type = 'table' AND name IN ('_schema_version', '_schema_history')",
    )
    .fetch_one(&mut *conn)
    .await?;
    if tables != 2 {
        return Err(StoreError::invalid(path, "schema version tables are missing"));
    }
    Ok(())
}

pub async fn read(conn: &mut SqliteConnection) -> Result<SchemaVersionRecord> {
    let current_version: i64 =
        sqlx::query_scalar("SELECT current_version FROM _schema_version WHERE id = 1")
            .fetch_one(&mut *conn)
            .await?;

    let rows = sqlx::query(
        "SELECT version, description, checksum, applied_at
         FROM _schema_history ORDER BY version",
    )
    .fetch_all(&mut *conn)
    .await?;

    let history = rows
        .iter()
        .map(|row| {
            Ok(AppliedMigration {
                version: row.try_get(0)?,
                description: row.try_get(1)?,
                checksum: row.try_get(2)?,
                applied_at: row.try_get(3)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SchemaVersionRecord {
        current_version,
        history,
    })
}

/// Advances the version from `expected_current` to `applied.version` and
/// records the unit in the history.
///
/// Returns `false` without writing anything when the stored version is no
/// longer `expected_current`, i.e. another process got there first. Must run
/// inside the unit's transaction.
pub async fn write(
    conn: &mut SqliteConnection,
    expected_current: i64,
    applied: &AppliedMigration,
) -> Result<bool> {
    let advanced = sqlx::query(
        "UPDATE _schema_version SET current_version = ?
         WHERE id = 1 AND current_version = ? AND current_version < ?",
    )
    .bind(applied.version)
    .bind(expected_current)
    .bind(applied.version)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if advanced == 0 {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO _schema_history (version, description, checksum, applied_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(applied.version)
    .bind(&applied.description)
    .bind(&applied.checksum)
    .bind(applied.applied_at)
    .execute(&mut *conn)
    .await?;

    Ok(true)
}
