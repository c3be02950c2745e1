//! Ordered, immutable list of schema migration units.
//!
//! The bundled catalog is built from `migrations/V<n>__<name>.sql`; `build.rs`
//! hashes each file at compile time so the checksum recorded in a store can be
//! compared with the code that is about to run against it. Catalogs can also
//! be loaded from a directory at runtime using the same naming scheme.

use crate::error::{Result, StoreError};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;

/// A migration compiled into this build.
#[derive(Debug)]
pub struct BundledMigration {
    pub version: i64,
    pub description: &'static str,
    pub checksum: &'static str,
    pub sql: &'static str,
}

include!(concat!(env!("OUT_DIR"), "/migrations.rs"));

/// SHA-256 of a unit's script, lower-case hex.
pub fn checksum(script: &str) -> String {
    Sha256::digest(script.as_bytes())
        .iter()
        .fold(String::with_capacity(64), |mut acc, b| {
            let _ = write!(acc, "{:02x}", b);
            acc
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    pub version: i64,
    pub description: String,
    pub script: String,
    pub checksum: String,
}

impl MigrationUnit {
    pub fn new(version: i64, description: impl Into<String>, script: impl Into<String>) -> Self {
        let script = script.into();
        Self {
            version,
            description: description.into(),
            checksum: checksum(&script),
            script,
        }
    }
}

impl From<&BundledMigration> for MigrationUnit {
    fn from(m: &BundledMigration) -> Self {
        Self {
            version: m.version,
            description: m.description.to_string(),
            script: m.sql.to_string(),
            checksum: m.checksum.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationCatalog {
    units: Vec<MigrationUnit>,
}

impl MigrationCatalog {
    /// Builds a catalog, rejecting non-positive or non-increasing versions.
    pub fn new(units: Vec<MigrationUnit>) -> Result<Self> {
        for unit in &units {
            if unit.version < 1 {
                return Err(StoreError::InvalidCatalog(format!(
                    "migration versions start at 1, got v{}",
                    unit.version
                )));
            }
        }
        for pair in units.windows(2) {
            if pair[0].version >= pair[1].version {
                return Err(StoreError::InvalidCatalog(format!(
                    "v{} must come after v{}",
                    pair[1].version, pair[0].version
                )));
            }
        }
        Ok(Self { units })
    }

    pub fn bundled() -> Self {
        Self {
            units: BUNDLED_MIGRATIONS.iter().map(MigrationUnit::from).collect(),
        }
    }

    /// Loads every `V<version>__<description>.sql` file in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut units = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let (version, description) = parse_file_stem(&stem)?;
            let script = std::fs::read_to_string(&path)?;
            units.push(MigrationUnit::new(version, description, script));
        }

        units.sort_by_key(|u| u.version);
        Self::new(units)
    }

    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn get(&self, version: i64) -> Option<&MigrationUnit> {
        self.units
            .binary_search_by_key(&version, |u| u.version)
            .ok()
            .map(|i| &self.units[i])
    }

    pub fn max_version(&self) -> i64 {
        self.units.last().map(|u| u.version).unwrap_or(0)
    }

    /// Units with `current < version <= target`, ascending.
    pub fn pending(&self, current: i64, target: i64) -> &[MigrationUnit] {
        let start = self.units.partition_point(|u| u.version <= current);
        let end = self.units.partition_point(|u| u.version <= target);
        if start >= end {
            &[]
        } else {
            &self.units[start..end]
        }
    }
}

fn parse_file_stem(stem: &str) -> Result<(i64, String)> {
    let invalid = || {
        StoreError::InvalidCatalog(format!(
            "migration file name must be V<version>__<description>.sql, got {:?}",
            stem
        ))
    };
    let (version, description) = stem
        .strip_prefix('V')
        .and_then(|rest| rest.split_once("__"))
        .ok_or_else(invalid)?;
    let version = version.parse::<i64>().map_err(|_| invalid())?;
    Ok((version, description.replace('_', " ")))
}
