use super::catalog::{MigrationCatalog, MigrationUnit};
use super::gate::{self, AppliedMigration, SchemaVersionRecord};
use crate::cache::DatabaseHandle;
use crate::concurrency::{retry_on_contention, RetryPolicy};
use crate::error::{Result, StoreError};
use chrono::Utc;
use serde::Serialize;
use sqlx::{Executor, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    /// Versions this run applied, ascending. Units applied concurrently by
    /// another process are not listed.
    pub applied: Vec<i64>,
}

enum UnitOutcome {
    Applied,
    /// Another process advanced the store first; nothing was written.
    Superseded,
}

/// Applies pending catalog units to a store, oldest first, one transaction
/// per unit.
///
/// Performs no authorization; callers check privilege before invoking it.
#[derive(Debug, Clone)]
pub struct MigrationEngine {
    catalog: Arc<MigrationCatalog>,
    retry: RetryPolicy,
}

impl MigrationEngine {
    pub fn new(catalog: Arc<MigrationCatalog>, retry: RetryPolicy) -> Self {
        Self { catalog, retry }
    }

    pub fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    /// Migrates to the newest catalog version.
    pub async fn migrate(&self, handle: &Arc<DatabaseHandle>) -> Result<MigrationReport> {
        self.migrate_to(handle, self.catalog.max_version()).await
    }

    /// Applies every unit with `current < version <= target`.
    ///
    /// Holds the handle exclusively for the whole run, so other operations on
    /// this handle wait until it returns. A failing unit is rolled back in
    /// full and later units are not attempted.
    pub async fn migrate_to(
        &self,
        handle: &Arc<DatabaseHandle>,
        target: i64,
    ) -> Result<MigrationReport> {
        let exclusive = handle.exclusive().await?;
        let pool = exclusive.pool();

        let record = self.read_record(pool).await?;
        let from_version = record.current_version;
        if from_version > target {
            return Err(StoreError::IncompatibleSchema {
                current: from_version,
                supported: target,
            });
        }
        self.verify_history(&record)?;

        let mut current = from_version;
        let mut applied = Vec::new();
        loop {
            let Some(unit) = self.catalog.pending(current, target).first() else {
                break;
            };

            tracing::info!(
                "Applying migration v{} ({}) to {}",
                unit.version,
                unit.description,
                handle.path()
            );

            let outcome = retry_on_contention(&self.retry, || apply_unit(pool, current, unit))
                .await
                .map_err(|e| {
                    tracing::warn!("Migration v{} failed: {}", unit.version, e);
                    match e {
                        StoreError::LockTimeout { .. } => e,
                        e => StoreError::MigrationFailed {
                            version: unit.version,
                            cause: e.to_string(),
                        },
                    }
                })?;

            match outcome {
                UnitOutcome::Applied => {
                    applied.push(unit.version);
                    current = unit.version;
                }
                UnitOutcome::Superseded => {
                    let record = self.read_record(pool).await?;
                    tracing::info!(
                        "Store {} was advanced to v{} by another process",
                        handle.path(),
                        record.current_version
                    );
                    if record.current_version > target {
                        return Err(StoreError::IncompatibleSchema {
                            current: record.current_version,
                            supported: target,
                        });
                    }
                    self.verify_history(&record)?;
                    current = record.current_version;
                }
            }
        }

        if !applied.is_empty() {
            tracing::info!(
                "Migrated {} from v{} to v{}",
                handle.path(),
                from_version,
                current
            );
        }

        Ok(MigrationReport {
            from_version,
            to_version: current,
            applied,
        })
    }

    async fn read_record(&self, pool: &SqlitePool) -> Result<SchemaVersionRecord> {
        retry_on_contention(&self.retry, || async move {
            let mut conn = pool.acquire().await?;
            gate::read(&mut *conn).await
        })
        .await
    }

    /// Fails when the store's history disagrees with the catalog: an applied
    /// unit whose script changed or disappeared, or a catalog unit at or below
    /// the current version that was never applied.
    pub fn verify_history(&self, record: &SchemaVersionRecord) -> Result<()> {
        let applied: HashMap<i64, &AppliedMigration> =
            record.history.iter().map(|h| (h.version, h)).collect();

        for entry in &record.history {
            match self.catalog.get(entry.version) {
                Some(unit) if unit.checksum == entry.checksum => {}
                Some(unit) => {
                    return Err(StoreError::CatalogDrift {
                        version: entry.version,
                        catalog: unit.checksum.clone(),
                        stored: entry.checksum.clone(),
                    })
                }
                None => {
                    return Err(StoreError::CatalogDrift {
                        version: entry.version,
                        catalog: "<absent>".to_string(),
                        stored: entry.checksum.clone(),
                    })
                }
            }
        }

        for unit in self.catalog.units() {
            if unit.version > record.current_version {
                break;
            }
            if !applied.contains_key(&unit.version) {
                return Err(StoreError::MissingMigration {
                    version: unit.version,
                    current: record.current_version,
                });
            }
        }

        Ok(())
    }
}

/// One unit in one transaction. The version is advanced before the script
/// runs so the write lock is taken up front; if another process already moved
/// the version the transaction is dropped untouched.
async fn apply_unit(pool: &SqlitePool, current: i64, unit: &MigrationUnit) -> Result<UnitOutcome> {
    let mut tx = pool.begin().await?;

    let entry = AppliedMigration {
        version: unit.version,
        description: unit.description.clone(),
        checksum: unit.checksum.clone(),
        applied_at: Utc::now(),
    };
    if !gate::write(&mut *tx, current, &entry).await? {
        return Ok(UnitOutcome::Superseded);
    }

    (&mut *tx).execute(sqlx::raw_sql(&unit.script)).await?;
    tx.commit().await?;

    Ok(UnitOutcome::Applied)
}
