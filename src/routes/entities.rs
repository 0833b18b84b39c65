//! Direct entity endpoints
//!
//! Single-entity CRUD outside the sync batch. Writes go through the
//! versioning guard and are broadcast to the rest of the organization.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header::ETAG, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::ApiResponse;
use crate::entities::{sanitize_fields, EntityType, NewEntity, SyncedEntity};
use crate::error::{AppError, Result};
use crate::events::{ChangeKind, Exclude};
use crate::identity::Identity;
use crate::state::AppState;
use crate::sync::versioning::{check_sync_token, expected_version, FieldWrite, VersionGuard};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

/// Create the entity router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:entity_type", get(list_entities).post(create_entity))
        .route(
            "/:entity_type/:id",
            get(get_entity)
                .put(replace_entity)
                .patch(patch_entity)
                .delete(delete_entity),
        )
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn parse_type(raw: &str) -> Result<EntityType> {
    raw.parse::<EntityType>()
        .map_err(|_| AppError::UnsupportedEntityType(raw.to_string()))
}

/// Single-entity response carrying the version as ETag
fn entity_response(status: StatusCode, entity: &SyncedEntity) -> Response {
    let mut response = (status, ApiResponse::ok(entity.to_json())).into_response();
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", entity.version)) {
        response.headers_mut().insert(ETAG, etag);
    }
    response
}

/// List live entities of a type
async fn list_entities(
    State(state): State<AppState>,
    identity: Identity,
    Path(entity_type): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<Value>>>> {
    let entity_type = parse_type(&entity_type)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let entities = state
        .store()
        .list(entity_type, &identity.organization_id, limit, offset)
        .await?;

    let data: Vec<Value> = entities.iter().map(SyncedEntity::to_json).collect();
    Ok(ApiResponse::with_meta(
        data,
        json!({ "limit": limit, "offset": offset }),
    ))
}

/// Get one live entity
async fn get_entity(
    State(state): State<AppState>,
    identity: Identity,
    Path((entity_type, id)): Path<(String, String)>,
) -> Result<Response> {
    let entity_type = parse_type(&entity_type)?;
    let entity = VersionGuard::new(state.store())
        .current(entity_type, &identity.organization_id, &id)
        .await?;

    Ok(entity_response(StatusCode::OK, &entity))
}

/// Create an entity at version 1
async fn create_entity(
    State(state): State<AppState>,
    identity: Identity,
    Path(entity_type): Path<String>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Response> {
    let entity_type = parse_type(&entity_type)?;
    let Json(body) = payload?;

    let client_id = body
        .get("clientId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let fields = sanitize_fields(Some(&body))?;

    let entity = state
        .store()
        .create(
            entity_type,
            NewEntity {
                id: None,
                organization_id: identity.organization_id.clone(),
                user_id: Some(identity.user_id.clone()),
                client_id,
                fields,
            },
        )
        .await?;

    tracing::info!("Created {} {} for {}", entity_type, entity.id, identity.organization_id);
    broadcast(&state, &identity, entity_type, ChangeKind::Created, &entity);

    Ok(entity_response(StatusCode::CREATED, &entity))
}

/// Replace the domain fields of an entity
async fn replace_entity(
    State(state): State<AppState>,
    identity: Identity,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Response> {
    let Json(body) = payload?;
    let fields = sanitize_fields(Some(&body))?;
    guarded_update(&state, &identity, &entity_type, &id, &headers, FieldWrite::Replace(fields)).await
}

/// Merge fields into an entity
async fn patch_entity(
    State(state): State<AppState>,
    identity: Identity,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Response> {
    let Json(body) = payload?;
    let fields = sanitize_fields(Some(&body))?;
    guarded_update(&state, &identity, &entity_type, &id, &headers, FieldWrite::Patch(fields)).await
}

async fn guarded_update(
    state: &AppState,
    identity: &Identity,
    entity_type: &str,
    id: &str,
    headers: &HeaderMap,
    write: FieldWrite,
) -> Result<Response> {
    let entity_type = parse_type(entity_type)?;
    ensure_current_token(state, identity, headers).await?;
    let expected = expected_version(headers)?;

    let entity = VersionGuard::new(state.store())
        .update(entity_type, &identity.organization_id, id, expected, write)
        .await?;

    tracing::debug!("Updated {} {} to version {}", entity_type, id, entity.version);
    broadcast(state, identity, entity_type, ChangeKind::Updated, &entity);

    Ok(entity_response(StatusCode::OK, &entity))
}

/// Soft-delete an entity; the version header is optional here
async fn delete_entity(
    State(state): State<AppState>,
    identity: Identity,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Value>>> {
    let entity_type = parse_type(&entity_type)?;
    ensure_current_token(&state, &identity, &headers).await?;
    let expected = match expected_version(&headers) {
        Ok(version) => Some(version),
        Err(AppError::VersionRequired) => None,
        Err(e) => return Err(e),
    };

    let entity = VersionGuard::new(state.store())
        .delete(entity_type, &identity.organization_id, &id, expected)
        .await?;

    tracing::info!("Deleted {} {} at version {}", entity_type, id, entity.version);
    broadcast(&state, &identity, entity_type, ChangeKind::Deleted, &entity);

    Ok(ApiResponse::ok(json!({
        "id": entity.id,
        "version": entity.version,
        "deletedAt": entity.deleted_at,
    })))
}

/// Reject writes made against a rotated sync token of the calling device
async fn ensure_current_token(
    state: &AppState,
    identity: &Identity,
    headers: &HeaderMap,
) -> Result<()> {
    let Some(device_id) = &identity.device_id else {
        return Ok(());
    };
    let session = state
        .engine()
        .sessions()
        .find(&identity.user_id, device_id)
        .await?;

    check_sync_token(session.as_ref(), headers)
}

fn broadcast(
    state: &AppState,
    identity: &Identity,
    entity_type: EntityType,
    kind: ChangeKind,
    entity: &SyncedEntity,
) {
    state.events().entity_changed(
        entity_type,
        kind,
        entity,
        json!({ "userId": identity.user_id }),
        Some(Exclude::User(identity.user_id.clone())),
    );
}
