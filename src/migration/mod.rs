//! Schema versioning for shared stores.
//!
//! ## Drift detection
//!
//! Each applied unit is recorded with the SHA-256 of its script. Before a
//! store is migrated the recorded history is compared with the catalog; a
//! changed or vanished script fails with `CatalogDrift` instead of silently
//! building on a schema this build does not know.

pub mod catalog;
mod engine;
pub mod gate;

pub use catalog::{
    checksum, BundledMigration, MigrationCatalog, MigrationUnit, BUNDLED_MIGRATIONS,
    REQUIRED_SCHEMA_VERSION,
};
pub use engine::{MigrationEngine, MigrationReport};
pub use gate::{AppliedMigration, SchemaVersionRecord, STORE_APPLICATION_ID};
