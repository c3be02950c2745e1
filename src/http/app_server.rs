use super::handlers::{
    dispose_handle, health, list_handles, migrate_store, provision_store, store_status,
};
use crate::runtime::StoreRuntime;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub const PATH_HEALTH: &str = "/health";
pub const PATH_HANDLES: &str = "/handles";
pub const PATH_STORE_STATUS: &str = "/stores/status";
pub const PATH_STORE_MIGRATE: &str = "/stores/migrate";
pub const PATH_STORE_PROVISION: &str = "/stores/provision";

pub struct AppServer {
    pub runtime: Arc<StoreRuntime>,
    pub router: Router,
}

impl AppServer {
    pub fn new(runtime: StoreRuntime) -> Self {
        let runtime = Arc::new(runtime);
        let router = Router::new()
            .route(PATH_HEALTH, get(health))
            .route(PATH_HANDLES, get(list_handles).delete(dispose_handle))
            .route(PATH_STORE_STATUS, get(store_status))
            .route(PATH_STORE_MIGRATE, post(migrate_store))
            .route(PATH_STORE_PROVISION, post(provision_store))
            .with_state(runtime.clone());

        Self { runtime, router }
    }
}
