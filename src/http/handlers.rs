use super::error::ApiError;
use crate::cache::{CanonicalPath, HandleInfo};
use crate::migration::MigrationReport;
use crate::runtime::StoreRuntime;
use crate::session::{CallerContext, StoreStatus};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Principal recorded for actions taken through the admin API.
pub const ADMIN_PRINCIPAL: &str = "admin-api";

pub type AppState = Arc<StoreRuntime>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub required_version: i64,
    pub open_handles: usize,
}

pub async fn health(State(runtime): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        required_version: runtime.selector().required_version(),
        open_handles: runtime.cache().list().len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct HandlesResponse {
    pub handles: Vec<HandleInfo>,
    pub constructed: u64,
}

pub async fn list_handles(State(runtime): State<AppState>) -> Json<HandlesResponse> {
    Json(HandlesResponse {
        handles: runtime.cache().list(),
        constructed: runtime.cache().constructed(),
    })
}

pub async fn dispose_handle(
    State(runtime): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<StatusCode, ApiError> {
    let path = CanonicalPath::resolve(&query.path)?;
    runtime.cache().dispose(&path).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn store_status(
    State(runtime): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<StoreStatus>, ApiError> {
    Ok(Json(runtime.selector().status(&query.path).await?))
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub path: String,
}

pub async fn migrate_store(
    State(runtime): State<AppState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<MigrationReport>, ApiError> {
    let context = if runtime.config().admin.allow_migrate {
        CallerContext::privileged(ADMIN_PRINCIPAL)
    } else {
        CallerContext::new(ADMIN_PRINCIPAL)
    };

    let report = runtime
        .selector()
        .force_migrate(&context, &request.path)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub path: String,
    pub display_name: Option<String>,
    /// Principal whose default selection becomes the new store.
    pub principal: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub path: String,
}

pub async fn provision_store(
    State(runtime): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<ProvisionResponse>), ApiError> {
    if request.path.trim().is_empty() {
        return Err(ApiError::bad_request("path must not be empty"));
    }

    let context = CallerContext::new(
        request
            .principal
            .unwrap_or_else(|| ADMIN_PRINCIPAL.to_string()),
    );
    let path = runtime
        .selector()
        .provision(&context, &request.path, request.display_name.as_deref())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ProvisionResponse {
            path: path.to_string(),
        }),
    ))
}
