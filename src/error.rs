//! Error types for the sync server

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Device identifier is required")]
    DeviceIdRequired,

    #[error("Entity version is required for this operation")]
    VersionRequired,

    #[error("Unsupported entity type: {0}")]
    UnsupportedEntityType(String),

    #[error("Version conflict: client has {client_version}, server has {server_version}")]
    VersionConflict {
        client_version: i64,
        server_version: i64,
        server_data: Value,
    },

    #[error("Sync token is stale")]
    SyncConflict {
        client_token: String,
        server_token: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Entity store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity_type} already exists: {key}")]
    Duplicate { entity_type: String, key: String },

    #[error("Unsupported entity type: {0}")]
    UnknownEntityType(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Machine-readable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::DeviceIdRequired => "DEVICE_ID_REQUIRED",
            AppError::VersionRequired => "VERSION_REQUIRED",
            AppError::UnsupportedEntityType(_) => "UNSUPPORTED_ENTITY_TYPE",
            AppError::VersionConflict { .. } => "VERSION_CONFLICT",
            AppError::SyncConflict { .. } => "SYNC_CONFLICT",
            AppError::Store(StoreError::Duplicate { .. }) => "DUPLICATE_ENTITY",
            AppError::Store(StoreError::UnknownEntityType(_)) => "UNSUPPORTED_ENTITY_TYPE",
            AppError::Store(StoreError::InvalidPayload(_)) => "BAD_REQUEST",
            AppError::Store(_) => "STORE_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_)
            | AppError::DeviceIdRequired
            | AppError::VersionRequired
            | AppError::UnsupportedEntityType(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::VersionConflict { .. } | AppError::SyncConflict { .. } => {
                StatusCode::CONFLICT
            }
            AppError::Store(StoreError::Duplicate { .. }) => StatusCode::CONFLICT,
            AppError::Store(StoreError::UnknownEntityType(_))
            | AppError::Store(StoreError::InvalidPayload(_)) => StatusCode::BAD_REQUEST,
            AppError::Store(_) | AppError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn details(&self) -> Map<String, Value> {
        let details = match self {
            AppError::VersionConflict {
                client_version,
                server_version,
                server_data,
            } => json!({
                "clientVersion": client_version,
                "serverVersion": server_version,
                "serverData": server_data,
            }),
            AppError::SyncConflict {
                client_token,
                server_token,
            } => json!({
                "clientSyncToken": client_token,
                "serverSyncToken": server_token,
            }),
            _ => return Map::new(),
        };

        match details {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    code: &'static str,
    #[serde(flatten)]
    details: Map<String, Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "Database error".to_string()
            }
            AppError::Store(e) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!("Store error: {}", e);
                "Store error".to_string()
            }
            AppError::VersionConflict { .. } | AppError::SyncConflict { .. } => {
                tracing::debug!("{}", self);
                self.to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            success: false,
            error: message,
            code: self.code(),
            details: self.details(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_errors_map_to_409() {
        let err = AppError::VersionConflict {
            client_version: 1,
            server_version: 2,
            server_data: json!({"id": "r-1", "version": 2}),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "VERSION_CONFLICT");

        let details = err.details();
        assert_eq!(details["serverVersion"], 2);
        assert_eq!(details["clientVersion"], 1);
        assert_eq!(details["serverData"]["id"], "r-1");
    }

    #[test]
    fn test_sync_conflict_echoes_both_tokens() {
        let err = AppError::SyncConflict {
            client_token: "sync_1_old".to_string(),
            server_token: "sync_2_new".to_string(),
        };
        let details = err.details();
        assert_eq!(details["clientSyncToken"], "sync_1_old");
        assert_eq!(details["serverSyncToken"], "sync_2_new");
    }

    #[test]
    fn test_client_input_errors_are_400() {
        assert_eq!(
            AppError::DeviceIdRequired.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::DeviceIdRequired.code(), "DEVICE_ID_REQUIRED");
        assert_eq!(
            AppError::Store(StoreError::UnknownEntityType("boat".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
