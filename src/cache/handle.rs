use super::path::CanonicalPath;
use crate::config::PoolConfig;
use crate::error::{Result, StoreError};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::fmt::{Debug, Formatter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Connection options shared by cached pools and one-off probe connections.
///
/// Rollback journal instead of WAL: WAL relies on shared memory, which does
/// not work across machines on a network share.
pub(crate) fn connect_options(path: &Path, config: &PoolConfig) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Delete)
        .busy_timeout(config.busy_timeout())
        .foreign_keys(true)
}

/// A live connection pool bound to one store file.
///
/// Shared by every caller using the same path. Each operation takes a
/// [`HandleLease`]; a migration takes an [`ExclusiveLease`] and holds off new
/// leases until it finishes. Resources are released only by
/// [`EngineCache::dispose`](super::EngineCache::dispose).
pub struct DatabaseHandle {
    id: u64,
    path: CanonicalPath,
    pool: SqlitePool,
    created_at: DateTime<Utc>,
    last_used_ms: AtomicI64,
    gate: Arc<RwLock<()>>,
    in_flight: AtomicUsize,
    disposed: AtomicBool,
}

impl DatabaseHandle {
    pub(crate) async fn open(path: CanonicalPath, config: &PoolConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(connect_options(path.as_path(), config))
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::Database(e) => StoreError::unavailable(path.to_string(), e),
                other => other,
            })?;

        let now = Utc::now();
        Ok(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            path,
            pool,
            created_at: now,
            last_used_ms: AtomicI64::new(now.timestamp_millis()),
            gate: Arc::new(RwLock::new(())),
            in_flight: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    /// Process-unique id; a re-created handle for the same path gets a new one.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &CanonicalPath {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_used_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }

    pub fn pool_size(&self) -> u32 {
        self.pool.size()
    }

    pub fn idle_connections(&self) -> usize {
        self.pool.num_idle()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn touch(&self) {
        self.last_used_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Shared access for one operation. Waits while a migration runs.
    pub async fn lease(self: &Arc<Self>) -> Result<HandleLease> {
        let guard = self.gate.clone().read_owned().await;
        if self.is_disposed() {
            return Err(StoreError::HandleDisposed(self.path.to_string()));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        Ok(HandleLease {
            handle: self.clone(),
            _guard: guard,
        })
    }

    /// Sole access, waiting for in-flight leases to drain.
    pub async fn exclusive(self: &Arc<Self>) -> Result<ExclusiveLease> {
        let guard = self.gate.clone().write_owned().await;
        if self.is_disposed() {
            return Err(StoreError::HandleDisposed(self.path.to_string()));
        }
        self.touch();
        Ok(ExclusiveLease {
            handle: self.clone(),
            _guard: guard,
        })
    }

    pub(crate) fn try_exclusive(self: &Arc<Self>) -> Option<ExclusiveLease> {
        let guard = self.gate.clone().try_write_owned().ok()?;
        Some(ExclusiveLease {
            handle: self.clone(),
            _guard: guard,
        })
    }

    /// Refuses all future leases. Callers must hold the exclusive lease.
    pub(crate) fn mark_disposed(&self, _exclusive: &ExclusiveLease) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Closes every pooled connection, releasing the file locks they hold.
    pub(crate) async fn close(&self, _exclusive: &ExclusiveLease) {
        self.pool.close().await;
    }
}

impl Debug for DatabaseHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("id", &self.id)
            .field("path", &self.path.key())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Shared, per-operation access to a handle's pool.
pub struct HandleLease {
    handle: Arc<DatabaseHandle>,
    _guard: OwnedRwLockReadGuard<()>,
}

impl HandleLease {
    pub fn pool(&self) -> &SqlitePool {
        &self.handle.pool
    }

    pub fn handle(&self) -> &Arc<DatabaseHandle> {
        &self.handle
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.handle.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sole access to a handle's pool; held by migrations and disposal.
pub struct ExclusiveLease {
    handle: Arc<DatabaseHandle>,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl ExclusiveLease {
    pub fn pool(&self) -> &SqlitePool {
        &self.handle.pool
    }

    pub fn handle(&self) -> &Arc<DatabaseHandle> {
        &self.handle
    }
}
