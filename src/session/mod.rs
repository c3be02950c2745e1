//! Per-caller store selection.
//!
//! A [`Selector`] validates a store path, checks its schema version against
//! what this build requires, and binds the cached handle to the caller's
//! [`SessionBinding`]. Incompatible or unmigrated stores are reported before
//! anything is acquired from the cache.

mod binding;
mod selection;

pub use binding::{CallerContext, SessionBinding};
pub use selection::{JsonFileSelectionStore, MemorySelectionStore, SelectionState, SelectionStore};

use crate::cache::{connect_options, CanonicalPath, DatabaseHandle, EngineCache};
use crate::concurrency::{retry_on_contention, RetryPolicy};
use crate::error::{Result, StoreError};
use crate::migration::{gate, MigrationEngine, MigrationReport, SchemaVersionRecord};
use serde::Serialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

#[derive(Debug, Clone)]
pub enum SelectOutcome {
    Ready(Arc<DatabaseHandle>),
    /// The store is older than this build and the caller may not migrate it.
    /// Nothing was bound and the store was not touched.
    MigrationRequired {
        current: i64,
        required: i64,
        pending: usize,
    },
}

impl SelectOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, SelectOutcome::Ready(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    Ready,
    MigrationRequired,
    Incompatible,
    /// Applied history disagrees with the loaded catalog.
    Drifted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub path: String,
    pub current: i64,
    pub required: i64,
    /// Newest version the loaded catalog can migrate to.
    pub supported: i64,
    pub pending: usize,
    pub state: StoreState,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct SelectorOptions {
    pub required_version: i64,
    pub default_path: Option<PathBuf>,
    pub auto_migrate: bool,
}

#[derive(Debug)]
pub struct Selector {
    cache: Arc<EngineCache>,
    engine: MigrationEngine,
    selections: Arc<dyn SelectionStore>,
    options: SelectorOptions,
    retry: RetryPolicy,
}

impl Selector {
    pub fn new(
        cache: Arc<EngineCache>,
        engine: MigrationEngine,
        selections: Arc<dyn SelectionStore>,
        options: SelectorOptions,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let supported = engine.catalog().max_version();
        if options.required_version < 0 || options.required_version > supported {
            return Err(StoreError::InvalidCatalog(format!(
                "required version {} is outside the catalog range 0..={}",
                options.required_version, supported
            )));
        }
        Ok(Self {
            cache,
            engine,
            selections,
            options,
            retry,
        })
    }

    pub fn required_version(&self) -> i64 {
        self.options.required_version
    }

    pub fn cache(&self) -> &Arc<EngineCache> {
        &self.cache
    }

    pub fn engine(&self) -> &MigrationEngine {
        &self.engine
    }

    pub fn selections(&self) -> &Arc<dyn SelectionStore> {
        &self.selections
    }

    /// Binds `path` to `binding` if its schema matches the required version.
    ///
    /// Older stores are migrated first when the caller is privileged and
    /// auto-migration is enabled; otherwise `MigrationRequired` is returned
    /// and the binding keeps its previous selection. Newer stores fail with
    /// `IncompatibleSchema`.
    pub async fn select(
        &self,
        binding: &mut SessionBinding,
        path: impl AsRef<Path>,
    ) -> Result<SelectOutcome> {
        let (canonical, record) = self.probe(path.as_ref()).await?;
        let current = record.current_version;
        let required = self.options.required_version;

        if current > required {
            tracing::warn!(
                "Rejected {}: schema v{} is newer than supported v{}",
                canonical,
                current,
                required
            );
            return Err(StoreError::IncompatibleSchema {
                current,
                supported: required,
            });
        }

        if let Err(e) = self.engine.verify_history(&record) {
            tracing::warn!("Rejected {}: {}", canonical, e);
            return Err(e);
        }

        if current < required {
            let pending = self.engine.catalog().pending(current, required).len();
            let context = binding.context();
            if !(context.privileged && self.options.auto_migrate) {
                tracing::debug!(
                    "{} needs migration v{} -> v{}; caller {} may not migrate",
                    canonical,
                    current,
                    required,
                    context.principal
                );
                return Ok(SelectOutcome::MigrationRequired {
                    current,
                    required,
                    pending,
                });
            }

            let handle = self.cache.acquire(&canonical).await?;
            let report = self.engine.migrate_to(&handle, required).await?;
            tracing::info!(
                "Caller {} migrated {} to v{} ({} units)",
                context.principal,
                canonical,
                report.to_version,
                report.applied.len()
            );

            let after = self.read_version(&handle).await?;
            if after != required {
                return Err(StoreError::MigrationRequired {
                    current: after,
                    required,
                    pending: self.engine.catalog().pending(after, required).len(),
                });
            }
            return self.bind(binding, canonical, handle).await;
        }

        let handle = self.cache.acquire(&canonical).await?;
        self.bind(binding, canonical, handle).await
    }

    /// Selects the caller's last persisted store, falling back to the
    /// configured default path.
    pub async fn select_default(&self, binding: &mut SessionBinding) -> Result<SelectOutcome> {
        let persisted = self.selections.load(&binding.context().principal).await?;
        let path = match (persisted, &self.options.default_path) {
            (Some(state), _) => PathBuf::from(state.last_selected_path),
            (None, Some(default)) => default.clone(),
            (None, None) => return Err(StoreError::NotSelected),
        };
        self.select(binding, path).await
    }

    /// Switches `binding` to `path`. The previous handle reference is
    /// released only when the new selection is ready; it is never disposed.
    pub async fn rebind(
        &self,
        binding: &mut SessionBinding,
        path: impl AsRef<Path>,
    ) -> Result<SelectOutcome> {
        let previous = binding.selected_path().cloned();
        let outcome = self.select(binding, path).await?;
        if let (Some(previous), true) = (previous, outcome.is_ready()) {
            tracing::debug!(
                "Caller {} switched from {}",
                binding.context().principal,
                previous
            );
        }
        Ok(outcome)
    }

    pub fn current(&self, binding: &SessionBinding) -> Option<Arc<DatabaseHandle>> {
        binding.current().cloned()
    }

    /// Migrates `path` to the required version regardless of
    /// `auto_migrate`. Privileged callers only.
    pub async fn force_migrate(
        &self,
        context: &CallerContext,
        path: impl AsRef<Path>,
    ) -> Result<MigrationReport> {
        if !context.privileged {
            return Err(StoreError::PermissionDenied(format!(
                "{} may not migrate stores",
                context.principal
            )));
        }

        let (canonical, record) = self.probe(path.as_ref()).await?;
        let required = self.options.required_version;
        if record.current_version > required {
            return Err(StoreError::IncompatibleSchema {
                current: record.current_version,
                supported: required,
            });
        }
        self.engine.verify_history(&record)?;

        let handle = self.cache.acquire(&canonical).await?;
        self.engine.migrate_to(&handle, required).await
    }

    pub async fn status(&self, path: impl AsRef<Path>) -> Result<StoreStatus> {
        let (canonical, record) = self.probe(path.as_ref()).await?;
        let current = record.current_version;
        let required = self.options.required_version;
        let state = match current.cmp(&required) {
            std::cmp::Ordering::Greater => StoreState::Incompatible,
            _ if self.engine.verify_history(&record).is_err() => StoreState::Drifted,
            std::cmp::Ordering::Equal => StoreState::Ready,
            std::cmp::Ordering::Less => StoreState::MigrationRequired,
        };

        Ok(StoreStatus {
            path: canonical.to_string(),
            current,
            required,
            supported: self.engine.catalog().max_version(),
            pending: self.engine.catalog().pending(current, required).len(),
            state,
            cached: self.cache.get(&canonical).is_some(),
        })
    }

    /// Creates an empty store at version 0. Never overwrites an existing file.
    ///
    /// When `display_name` is given the new store becomes `principal`'s
    /// persisted default.
    pub async fn provision(
        &self,
        context: &CallerContext,
        path: impl AsRef<Path>,
        display_name: Option<&str>,
    ) -> Result<CanonicalPath> {
        let target = CanonicalPath::resolve(path.as_ref())?;
        if tokio::fs::try_exists(target.as_path()).await? {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", target),
            )));
        }

        let options = connect_options(target.as_path(), self.cache.config()).create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| StoreError::unavailable(target.to_string(), e))?;
        gate::initialize(&mut conn).await?;
        conn.close().await?;

        // Re-resolve now that the file exists so symlinked parents are
        // followed.
        let canonical = CanonicalPath::resolve(target.as_path())?;
        tracing::info!("Provisioned store {}", canonical);

        if let Some(name) = display_name {
            self.selections
                .save(
                    &context.principal,
                    &SelectionState {
                        last_selected_path: canonical.to_string(),
                        display_name: name.to_string(),
                    },
                )
                .await?;
        }
        Ok(canonical)
    }

    async fn bind(
        &self,
        binding: &mut SessionBinding,
        path: CanonicalPath,
        handle: Arc<DatabaseHandle>,
    ) -> Result<SelectOutcome> {
        let principal = binding.context().principal.clone();
        let display_name = match self.selections.load(&principal).await? {
            Some(state) if state.last_selected_path == path.to_string() => state.display_name,
            _ => path.file_name(),
        };
        self.selections
            .save(
                &principal,
                &SelectionState {
                    last_selected_path: path.to_string(),
                    display_name,
                },
            )
            .await?;

        tracing::debug!("Caller {} selected {} (handle {})", principal, path, handle.id());
        binding.bind(path, handle.clone());
        Ok(SelectOutcome::Ready(handle))
    }

    async fn read_version(&self, handle: &Arc<DatabaseHandle>) -> Result<i64> {
        let lease = handle.lease().await?;
        let pool = lease.pool();
        let record = retry_on_contention(&self.retry, || async move {
            let mut conn = pool.acquire().await?;
            gate::read(&mut *conn).await
        })
        .await?;
        Ok(record.current_version)
    }

    /// Validates the file and reads its version record without going through
    /// the cache.
    async fn probe(&self, path: &Path) -> Result<(CanonicalPath, SchemaVersionRecord)> {
        let canonical = CanonicalPath::resolve(path)?;
        check_store_file(&canonical).await?;

        let options = SqliteConnectOptions::new()
            .filename(canonical.as_path())
            .read_only(true)
            .busy_timeout(self.cache.config().busy_timeout());
        let canonical_ref = &canonical;
        let options_ref = &options;

        let record = retry_on_contention(&self.retry, || async move {
            let mut conn = SqliteConnection::connect_with(options_ref)
                .await
                .map_err(|e| match StoreError::from(e) {
                    StoreError::Database(e) => {
                        StoreError::unavailable(canonical_ref.to_string(), e)
                    }
                    other => other,
                })?;
            let result = async {
                gate::identify(&mut conn, &canonical_ref.to_string()).await?;
                gate::read(&mut conn).await
            }
            .await;
            let _ = conn.close().await;
            result
        })
        .await?;

        Ok((canonical, record))
    }
}

async fn check_store_file(path: &CanonicalPath) -> Result<()> {
    let mut file = tokio::fs::File::open(path.as_path())
        .await
        .map_err(|e| StoreError::unavailable(path.to_string(), e))?;

    let metadata = file
        .metadata()
        .await
        .map_err(|e| StoreError::unavailable(path.to_string(), e))?;
    if !metadata.is_file() {
        return Err(StoreError::unavailable(path.to_string(), "not a regular file"));
    }

    let mut header = [0u8; 16];
    match file.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(StoreError::invalid(path.to_string(), "file is too short"));
        }
        Err(e) => return Err(StoreError::unavailable(path.to_string(), e)),
    }
    if &header != SQLITE_HEADER {
        return Err(StoreError::invalid(path.to_string(), "not a SQLite database"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let path = CanonicalPath::resolve(dir.path().join("absent.db")).unwrap();
        assert!(matches!(
            check_store_file(&path).await,
            Err(StoreError::StoreUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_text_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("notes.db");
        std::fs::write(&file, b"this is definitely not sqlite").unwrap();
        let path = CanonicalPath::resolve(&file).unwrap();
        assert!(matches!(
            check_store_file(&path).await,
            Err(StoreError::StoreInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_short_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("empty.db");
        std::fs::write(&file, b"SQLite").unwrap();
        let path = CanonicalPath::resolve(&file).unwrap();
        assert!(matches!(
            check_store_file(&path).await,
            Err(StoreError::StoreInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_directory_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let path = CanonicalPath::resolve(dir.path()).unwrap();
        assert!(check_store_file(&path).await.is_err());
    }
}
