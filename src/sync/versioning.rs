//! Versioning guard for direct entity edits
//!
//! Single-entity writes outside the sync batch carry the version the client
//! last saw (`X-Entity-Version`, or an `If-Match` ETag). The write only goes
//! through when that version is still current.

use axum::http::{header::IF_MATCH, HeaderMap};
use serde_json::{Map, Value};

use super::types::SyncSession;
use crate::entities::{merge_fields, EntityStore, EntityType, SyncedEntity};
use crate::error::{AppError, Result};

pub const ENTITY_VERSION_HEADER: &str = "x-entity-version";
pub const SYNC_TOKEN_HEADER: &str = "x-sync-token";

/// How a guarded write combines with the stored fields
#[derive(Debug, Clone)]
pub enum FieldWrite {
    /// Replace all domain fields (PUT)
    Replace(Map<String, Value>),
    /// Shallow-merge onto the stored fields (PATCH)
    Patch(Map<String, Value>),
}

/// Version the client claims to be editing
pub fn expected_version(headers: &HeaderMap) -> Result<i64> {
    let raw = headers
        .get(ENTITY_VERSION_HEADER)
        .or_else(|| headers.get(IF_MATCH))
        .ok_or(AppError::VersionRequired)?
        .to_str()
        .map_err(|_| AppError::BadRequest("version header is not valid text".to_string()))?;

    let trimmed = raw.trim().trim_start_matches("W/").trim_matches('"');
    trimmed
        .parse::<i64>()
        .map_err(|_| AppError::BadRequest(format!("invalid entity version: {raw}")))
}

/// Reject a write made against a sync token the session has since rotated
pub fn check_sync_token(session: Option<&SyncSession>, headers: &HeaderMap) -> Result<()> {
    let (Some(session), Some(client_token)) = (
        session,
        headers.get(SYNC_TOKEN_HEADER).and_then(|v| v.to_str().ok()),
    ) else {
        return Ok(());
    };

    if client_token != session.sync_token {
        return Err(AppError::SyncConflict {
            client_token: client_token.to_string(),
            server_token: session.sync_token.clone(),
        });
    }

    Ok(())
}

/// Optimistic-concurrency gate in front of the entity store
pub struct VersionGuard<'a> {
    store: &'a dyn EntityStore,
}

impl<'a> VersionGuard<'a> {
    pub fn new(store: &'a dyn EntityStore) -> Self {
        Self { store }
    }

    /// Fetch a live entity; missing and soft-deleted are both 404
    pub async fn current(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        id: &str,
    ) -> Result<SyncedEntity> {
        match self.store.find(entity_type, organization_id, id).await? {
            Some(entity) if !entity.is_deleted() => Ok(entity),
            _ => Err(AppError::NotFound(format!("{entity_type} {id}"))),
        }
    }

    /// Write `fields` if `expected_version` is still current
    pub async fn update(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        id: &str,
        expected_version: i64,
        write: FieldWrite,
    ) -> Result<SyncedEntity> {
        let current = self.current(entity_type, organization_id, id).await?;
        check_version(&current, expected_version)?;

        let fields = match write {
            FieldWrite::Replace(fields) => fields,
            FieldWrite::Patch(fields) => merge_fields(&current.fields, &fields),
        };

        match self
            .store
            .update_if_version(entity_type, organization_id, id, Some(expected_version), fields)
            .await?
        {
            Some(updated) => Ok(updated),
            None => Err(self.lost_race(entity_type, organization_id, id, expected_version).await),
        }
    }

    /// Soft-delete if `expected_version` is still current
    pub async fn delete(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        id: &str,
        expected_version: Option<i64>,
    ) -> Result<SyncedEntity> {
        let current = self.current(entity_type, organization_id, id).await?;
        if let Some(expected) = expected_version {
            check_version(&current, expected)?;
        }

        match self
            .store
            .soft_delete_if_version(entity_type, organization_id, id, expected_version)
            .await?
        {
            Some(deleted) => Ok(deleted),
            None => Err(self
                .lost_race(entity_type, organization_id, id, expected_version.unwrap_or(current.version))
                .await),
        }
    }

    /// Error for a conditional write that matched no row
    async fn lost_race(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        id: &str,
        client_version: i64,
    ) -> AppError {
        match self.current(entity_type, organization_id, id).await {
            Ok(latest) => version_conflict(&latest, client_version),
            Err(e) => e,
        }
    }
}

fn check_version(current: &SyncedEntity, expected: i64) -> Result<()> {
    if current.version != expected {
        return Err(version_conflict(current, expected));
    }
    Ok(())
}

fn version_conflict(current: &SyncedEntity, client_version: i64) -> AppError {
    tracing::debug!(
        "Version conflict on {}: client {}, server {}",
        current.id,
        client_version,
        current.version
    );
    AppError::VersionConflict {
        client_version,
        server_version: current.version,
        server_data: current.to_json(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, epoch, now};
    use crate::entities::{NewEntity, SqliteEntityStore};
    use crate::sync::types::ConflictResolutionStrategy;
    use axum::http::HeaderValue;
    use serde_json::json;

    async fn setup() -> (SqliteEntityStore, SyncedEntity) {
        let store = SqliteEntityStore::new(create_memory_pool().await.unwrap());
        let entity = store
            .create(
                EntityType::Reservation,
                NewEntity {
                    organization_id: "org-1".to_string(),
                    fields: json!({"partySize": 2, "note": "old"}).as_object().cloned().unwrap(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        (store, entity)
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_expected_version_headers() {
        let mut headers = HeaderMap::new();
        assert!(matches!(expected_version(&headers), Err(AppError::VersionRequired)));

        headers.insert(IF_MATCH, HeaderValue::from_static("W/\"4\""));
        assert_eq!(expected_version(&headers).unwrap(), 4);

        headers.insert(ENTITY_VERSION_HEADER, HeaderValue::from_static("7"));
        assert_eq!(expected_version(&headers).unwrap(), 7);

        headers.insert(ENTITY_VERSION_HEADER, HeaderValue::from_static("seven"));
        assert!(matches!(expected_version(&headers), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_stale_sync_token_is_rejected() {
        let session = SyncSession {
            id: "s-1".to_string(),
            user_id: "user-1".to_string(),
            device_id: "device-a".to_string(),
            platform: None,
            app_version: None,
            last_sync_at: epoch(),
            sync_token: "sync_2_current00".to_string(),
            conflict_resolution_strategy: ConflictResolutionStrategy::ServerWins,
            pull_checkpoint: None,
            created_at: now(),
            updated_at: now(),
        };

        let mut headers = HeaderMap::new();
        assert!(check_sync_token(Some(&session), &headers).is_ok());

        headers.insert(SYNC_TOKEN_HEADER, HeaderValue::from_static("sync_1_stale0000"));
        assert!(check_sync_token(None, &headers).is_ok());
        match check_sync_token(Some(&session), &headers) {
            Err(AppError::SyncConflict {
                client_token,
                server_token,
            }) => {
                assert_eq!(client_token, "sync_1_stale0000");
                assert_eq!(server_token, "sync_2_current00");
            }
            other => panic!("expected sync conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_patch_merges_and_put_replaces() {
        let (store, entity) = setup().await;
        let guard = VersionGuard::new(&store);

        let patched = guard
            .update(
                EntityType::Reservation,
                "org-1",
                &entity.id,
                1,
                FieldWrite::Patch(fields(json!({"note": "new"}))),
            )
            .await
            .unwrap();
        assert_eq!(patched.version, 2);
        assert_eq!(patched.fields["partySize"], 2);
        assert_eq!(patched.fields["note"], "new");

        let replaced = guard
            .update(
                EntityType::Reservation,
                "org-1",
                &entity.id,
                2,
                FieldWrite::Replace(fields(json!({"note": "only"}))),
            )
            .await
            .unwrap();
        assert_eq!(replaced.version, 3);
        assert!(!replaced.fields.contains_key("partySize"));
    }

    #[tokio::test]
    async fn test_stale_version_is_conflict() {
        let (store, entity) = setup().await;
        let guard = VersionGuard::new(&store);

        guard
            .update(EntityType::Reservation, "org-1", &entity.id, 1, FieldWrite::Patch(Map::new()))
            .await
            .unwrap();

        let err = guard
            .update(EntityType::Reservation, "org-1", &entity.id, 1, FieldWrite::Patch(Map::new()))
            .await
            .unwrap_err();
        match err {
            AppError::VersionConflict {
                client_version,
                server_version,
                server_data,
            } => {
                assert_eq!(client_version, 1);
                assert_eq!(server_version, 2);
                assert_eq!(server_data["version"], 2);
            }
            other => panic!("expected version conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deleted_entity_is_not_found() {
        let (store, entity) = setup().await;
        let guard = VersionGuard::new(&store);

        let deleted = guard
            .delete(EntityType::Reservation, "org-1", &entity.id, Some(1))
            .await
            .unwrap();
        assert_eq!(deleted.version, 2);

        let err = guard
            .update(EntityType::Reservation, "org-1", &entity.id, 2, FieldWrite::Patch(Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
