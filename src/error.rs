use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable at {path}: {reason}")]
    StoreUnavailable { path: String, reason: String },

    #[error("not a recognized store at {path}: {reason}")]
    StoreInvalid { path: String, reason: String },

    /// The store was written by a newer build. Never resolved automatically.
    #[error("store schema v{current} is newer than this build supports (v{supported})")]
    IncompatibleSchema { current: i64, supported: i64 },

    #[error("store schema v{current} requires migration to v{required} ({pending} pending)")]
    MigrationRequired {
        current: i64,
        required: i64,
        pending: usize,
    },

    #[error("migration v{version} failed: {cause}")]
    MigrationFailed { version: i64, cause: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("store still locked after {attempts} attempts")]
    LockTimeout { attempts: u32 },

    #[error("write conflict: expected token {expected}, found {actual}")]
    Conflict { expected: i64, actual: i64 },

    /// Transient busy/locked report from SQLite. Retried by the concurrency
    /// controller and never surfaced past it.
    #[error("store is locked: {0}")]
    LockContention(String),

    #[error("migration v{version} was modified after being applied (catalog {catalog}, stored {stored})")]
    CatalogDrift {
        version: i64,
        catalog: String,
        stored: String,
    },

    #[error("migration v{version} is missing but the store is at v{current}")]
    MissingMigration { version: i64, current: i64 },

    #[error("invalid migration catalog: {0}")]
    InvalidCatalog(String),

    #[error("no cached handle for {0}")]
    HandleNotFound(String),

    #[error("handle for {0} has operations in flight")]
    HandleBusy(String),

    #[error("handle for {0} has been disposed")]
    HandleDisposed(String),

    #[error("no database selected")]
    NotSelected,

    #[error("{table} record {key} not found")]
    RecordNotFound { table: String, key: i64 },

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(path: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::StoreUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(path: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::StoreInvalid {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, StoreError::LockContention(_))
    }
}

// SQLite primary result codes; extended codes carry these in the low byte.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Returns true when SQLite reports the file as transiently held by another
/// connection or process.
pub fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let by_code = db
                .code()
                .and_then(|c| c.parse::<i64>().ok())
                .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
                .unwrap_or(false);
            by_code || db.message().contains("database is locked")
        }
        _ => false,
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if is_busy(&e) {
            StoreError::LockContention(e.to_string())
        } else {
            StoreError::Database(e)
        }
    }
}
