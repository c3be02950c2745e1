use crate::error::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error with HTTP status code
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: code.to_string(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            message,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "code": self.code,
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::StoreUnavailable { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, "STORE_UNAVAILABLE", message)
            }
            StoreError::StoreInvalid { .. } => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "STORE_INVALID", message)
            }
            StoreError::IncompatibleSchema { .. } => {
                ApiError::new(StatusCode::CONFLICT, "INCOMPATIBLE_SCHEMA", message)
            }
            StoreError::MigrationRequired { .. } => {
                ApiError::new(StatusCode::CONFLICT, "MIGRATION_REQUIRED", message)
            }
            StoreError::CatalogDrift { .. } | StoreError::MissingMigration { .. } => {
                ApiError::new(StatusCode::CONFLICT, "CATALOG_DRIFT", message)
            }
            StoreError::Conflict { .. } => ApiError::conflict(message),
            StoreError::HandleBusy(_) => ApiError::new(StatusCode::CONFLICT, "HANDLE_BUSY", message),
            StoreError::HandleDisposed(_) => ApiError::new(StatusCode::GONE, "HANDLE_DISPOSED", message),
            StoreError::PermissionDenied(_) => ApiError::forbidden(message),
            StoreError::LockTimeout { .. } | StoreError::LockContention(_) => {
                ApiError::service_unavailable(message)
            }
            StoreError::HandleNotFound(_) | StoreError::RecordNotFound { .. } => {
                ApiError::not_found(message)
            }
            StoreError::NotSelected | StoreError::InvalidIdentifier(_) => {
                ApiError::bad_request(message)
            }
            StoreError::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                ApiError::new(StatusCode::CONFLICT, "ALREADY_EXISTS", message)
            }
            StoreError::MigrationFailed { .. } => {
                tracing::error!("{}", message);
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "MIGRATION_FAILED", message)
            }
            StoreError::InvalidCatalog(_)
            | StoreError::Database(_)
            | StoreError::Io(_)
            | StoreError::Serialization(_) => {
                tracing::error!("{}", message);
                ApiError::internal_error(message)
            }
        }
    }
}
