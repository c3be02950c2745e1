use crate::cache::EngineCache;
use crate::concurrency::{ConcurrencyController, RetryPolicy};
use crate::config::AppConfig;
use crate::error::Result;
use crate::migration::{MigrationCatalog, MigrationEngine};
use crate::party::PartyStore;
use crate::session::{
    CallerContext, JsonFileSelectionStore, MemorySelectionStore, SelectionStore, SessionBinding,
    Selector, SelectorOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a process needs to serve stores, built once from config.
#[derive(Debug)]
pub struct StoreRuntime {
    config: AppConfig,
    cache: Arc<EngineCache>,
    selector: Arc<Selector>,
    controller: ConcurrencyController,
}

impl StoreRuntime {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let selections: Arc<dyn SelectionStore> = match &config.selection.state_path {
            Some(path) => Arc::new(JsonFileSelectionStore::new(path)),
            None => Arc::new(MemorySelectionStore::new()),
        };
        Self::with_selection_store(config, selections)
    }

    pub fn with_selection_store(
        config: &AppConfig,
        selections: Arc<dyn SelectionStore>,
    ) -> Result<Self> {
        let catalog = match &config.store.migrations_dir {
            Some(dir) => MigrationCatalog::load_dir(Path::new(dir))?,
            None => MigrationCatalog::bundled(),
        };
        Self::with_catalog(config, Arc::new(catalog), selections)
    }

    pub fn with_catalog(
        config: &AppConfig,
        catalog: Arc<MigrationCatalog>,
        selections: Arc<dyn SelectionStore>,
    ) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.retry);
        let cache = Arc::new(EngineCache::new(config.pool.clone()));
        let required_version = config
            .store
            .required_version
            .unwrap_or_else(|| catalog.max_version());

        tracing::info!(
            "Store runtime: schema v{} required, catalog up to v{} ({} units)",
            required_version,
            catalog.max_version(),
            catalog.units().len()
        );

        let engine = MigrationEngine::new(catalog, retry.clone());
        let selector = Selector::new(
            cache.clone(),
            engine,
            selections,
            SelectorOptions {
                required_version,
                default_path: config.store.default_path.as_ref().map(PathBuf::from),
                auto_migrate: config.store.auto_migrate,
            },
            retry.clone(),
        )?;

        Ok(Self {
            config: config.clone(),
            cache,
            selector: Arc::new(selector),
            controller: ConcurrencyController::new(retry),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<EngineCache> {
        &self.cache
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    pub fn parties(&self) -> PartyStore {
        PartyStore::new(self.controller.clone())
    }

    pub fn binding(&self, context: CallerContext) -> SessionBinding {
        SessionBinding::new(context)
    }
}
