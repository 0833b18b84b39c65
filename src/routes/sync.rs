//! Sync API endpoints
//!
//! Pull, push, conflict resolution and session management for devices.
//! Every route requires the device identifier header.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::ApiResponse;
use crate::entities::EntityType;
use crate::error::{AppError, Result};
use crate::identity::DeviceIdentity;
use crate::state::AppState;
use crate::sync::{
    ChangeRecord, ConflictEntry, ConflictResolutionStrategy, PushOutcome, Resolution,
    ResolveOutcome, SyncSession, SyncStatus,
};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pull", post(pull_changes))
        .route("/push", post(push_changes))
        .route("/resolve-conflicts", post(resolve_conflicts))
        .route("/status", get(sync_status))
        .route("/reset", post(reset_sync))
        .route("/settings", put(update_settings))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Overrides the session cursor when present
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entity_types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: Vec<ChangeRecord>,
    #[serde(default)]
    pub sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub conflicts: Vec<ConflictEntry>,
    #[serde(default)]
    pub resolutions: Vec<Option<Resolution>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRequest {
    pub conflict_resolution_strategy: ConflictResolutionStrategy,
}

/// Pull changes since the device's cursor
async fn pull_changes(
    State(state): State<AppState>,
    identity: DeviceIdentity,
    payload: std::result::Result<Json<PullRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Map<String, Value>>>> {
    let Json(req) = payload?;

    let entity_types = req
        .entity_types
        .map(|names| {
            names
                .iter()
                .map(|name| {
                    name.parse::<EntityType>()
                        .map_err(|_| AppError::UnsupportedEntityType(name.clone()))
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let outcome = state
        .engine()
        .pull(&identity, req.last_sync_time, entity_types)
        .await?;

    let mut data: Map<String, Value> = outcome
        .changes
        .into_iter()
        .map(|(collection, records)| (collection, json!(records)))
        .collect();
    data.insert("deletions".to_string(), json!(outcome.deletions));

    Ok(ApiResponse::with_meta(
        data,
        json!({
            "syncToken": outcome.sync_token,
            "serverTime": outcome.server_time,
            "hasMore": outcome.has_more,
            "deviceId": identity.device_id,
            "userId": identity.user_id,
        }),
    ))
}

/// Apply a batch of client changes
async fn push_changes(
    State(state): State<AppState>,
    identity: DeviceIdentity,
    payload: std::result::Result<Json<PushRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<PushOutcome>>> {
    let Json(req) = payload?;

    let result = state
        .engine()
        .push(&identity, req.changes, req.sync_token.as_deref())
        .await?;

    Ok(ApiResponse::with_meta(
        result.outcome,
        json!({
            "syncToken": result.sync_token,
            "serverTime": result.server_time,
        }),
    ))
}

/// Resolve conflicts returned by an earlier push
async fn resolve_conflicts(
    State(state): State<AppState>,
    identity: DeviceIdentity,
    payload: std::result::Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<ResolveOutcome>>> {
    let Json(req) = payload?;

    let outcome = state
        .engine()
        .resolve(&identity, req.conflicts, req.resolutions)
        .await?;

    Ok(ApiResponse::ok(outcome))
}

/// Session snapshot for the calling device
async fn sync_status(
    State(state): State<AppState>,
    identity: DeviceIdentity,
) -> Result<Json<ApiResponse<SyncStatus>>> {
    let status = state.engine().status(&identity).await?;
    Ok(ApiResponse::ok(status))
}

/// Force a full resync on the next pull
async fn reset_sync(
    State(state): State<AppState>,
    identity: DeviceIdentity,
) -> Result<Json<ApiResponse<SyncSession>>> {
    let session = state.engine().reset(&identity).await?;
    Ok(ApiResponse::with_meta(
        session.clone(),
        json!({ "syncToken": session.sync_token }),
    ))
}

/// Change the device's default conflict strategy
async fn update_settings(
    State(state): State<AppState>,
    identity: DeviceIdentity,
    payload: std::result::Result<Json<SettingsRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<SyncSession>>> {
    let Json(req) = payload?;

    let session = state
        .engine()
        .update_settings(&identity, req.conflict_resolution_strategy)
        .await?;

    Ok(ApiResponse::ok(session))
}
