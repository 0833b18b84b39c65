//! Entity store seam and its SQLite implementation
//!
//! The sync engine only talks to entities through [`EntityStore`]. Every
//! mutating call is a single conditional statement, so the version check and
//! the increment happen atomically inside SQLite.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::types::{ChangePosition, EntityType, NewEntity, SyncedEntity};
use crate::db::{decode_timestamp, encode_timestamp, now};
use crate::error::StoreError;

/// Typed CRUD over synced entities, scoped by organization
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Get an entity by id, including soft-deleted rows
    async fn find(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        id: &str,
    ) -> Result<Option<SyncedEntity>, StoreError>;

    /// Get an entity by the client-generated dedup key
    async fn find_by_client_id(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        client_id: &str,
    ) -> Result<Option<SyncedEntity>, StoreError>;

    /// List live entities, newest first
    async fn list(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SyncedEntity>, StoreError>;

    /// Entities modified after `after`, ordered by `(updated_at, id)`,
    /// soft-deleted rows included
    async fn changed_since(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        after: &ChangePosition,
        limit: u32,
    ) -> Result<Vec<SyncedEntity>, StoreError>;

    /// Insert a new entity at version 1
    ///
    /// Fails with [`StoreError::Duplicate`] when the id or client id exists.
    async fn create(
        &self,
        entity_type: EntityType,
        entity: NewEntity,
    ) -> Result<SyncedEntity, StoreError>;

    /// Replace the domain fields of a live entity and bump its version.
    ///
    /// With `expected_version` set the write only happens if the stored
    /// version still matches. `Ok(None)` means nothing was written.
    async fn update_if_version(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        id: &str,
        expected_version: Option<i64>,
        fields: Map<String, Value>,
    ) -> Result<Option<SyncedEntity>, StoreError>;

    /// Soft-delete a live entity and bump its version, same contract as
    /// [`EntityStore::update_if_version`]
    async fn soft_delete_if_version(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        id: &str,
        expected_version: Option<i64>,
    ) -> Result<Option<SyncedEntity>, StoreError>;
}

/// SQLite-backed entity store
#[derive(Clone)]
pub struct SqliteEntityStore {
    pool: SqlitePool,
}

impl SqliteEntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const COLUMNS: &str =
    "id, organization_id, user_id, client_id, version, data, created_at, updated_at, deleted_at";

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn find(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        id: &str,
    ) -> Result<Option<SyncedEntity>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM {} WHERE id = ? AND organization_id = ?",
            entity_type.table()
        );

        let row = sqlx::query_as::<_, EntityRow>(&query)
            .bind(id)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(EntityRow::into_entity).transpose()
    }

    async fn find_by_client_id(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        client_id: &str,
    ) -> Result<Option<SyncedEntity>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM {} WHERE client_id = ? AND organization_id = ?",
            entity_type.table()
        );

        let row = sqlx::query_as::<_, EntityRow>(&query)
            .bind(client_id)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(EntityRow::into_entity).transpose()
    }

    async fn list(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SyncedEntity>, StoreError> {
        let query = format!(
            r#"
            SELECT {COLUMNS} FROM {}
            WHERE organization_id = ? AND deleted_at IS NULL
            ORDER BY updated_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
            entity_type.table()
        );

        let rows = sqlx::query_as::<_, EntityRow>(&query)
            .bind(organization_id)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    async fn changed_since(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        after: &ChangePosition,
        limit: u32,
    ) -> Result<Vec<SyncedEntity>, StoreError> {
        let cursor = encode_timestamp(&after.updated_at);

        let rows = match &after.id {
            Some(last_id) => {
                let query = format!(
                    r#"
                    SELECT {COLUMNS} FROM {}
                    WHERE organization_id = ?
                      AND (updated_at > ? OR (updated_at = ? AND id > ?))
                    ORDER BY updated_at ASC, id ASC
                    LIMIT ?
                    "#,
                    entity_type.table()
                );
                sqlx::query_as::<_, EntityRow>(&query)
                    .bind(organization_id)
                    .bind(&cursor)
                    .bind(&cursor)
                    .bind(last_id)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    r#"
                    SELECT {COLUMNS} FROM {}
                    WHERE organization_id = ? AND updated_at > ?
                    ORDER BY updated_at ASC, id ASC
                    LIMIT ?
                    "#,
                    entity_type.table()
                );
                sqlx::query_as::<_, EntityRow>(&query)
                    .bind(organization_id)
                    .bind(&cursor)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    async fn create(
        &self,
        entity_type: EntityType,
        entity: NewEntity,
    ) -> Result<SyncedEntity, StoreError> {
        let id = entity.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let timestamp = encode_timestamp(&now());
        let data = serde_json::to_string(&Value::Object(entity.fields))?;
        let dedup_key = entity.client_id.clone().unwrap_or_else(|| id.clone());

        let query = format!(
            r#"
            INSERT INTO {} (id, organization_id, user_id, client_id, version, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, 1, ?, ?, ?)
            RETURNING {COLUMNS}
            "#,
            entity_type.table()
        );

        let row = sqlx::query_as::<_, EntityRow>(&query)
            .bind(&id)
            .bind(&entity.organization_id)
            .bind(&entity.user_id)
            .bind(&entity.client_id)
            .bind(&data)
            .bind(&timestamp)
            .bind(&timestamp)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| write_error(entity_type, &dedup_key, e))?;

        row.into_entity()
    }

    async fn update_if_version(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        id: &str,
        expected_version: Option<i64>,
        fields: Map<String, Value>,
    ) -> Result<Option<SyncedEntity>, StoreError> {
        let data = serde_json::to_string(&Value::Object(fields))?;

        let query = format!(
            r#"
            UPDATE {}
            SET data = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND organization_id = ? AND deleted_at IS NULL
              AND (? IS NULL OR version = ?)
            RETURNING {COLUMNS}
            "#,
            entity_type.table()
        );

        let row = sqlx::query_as::<_, EntityRow>(&query)
            .bind(&data)
            .bind(encode_timestamp(&now()))
            .bind(id)
            .bind(organization_id)
            .bind(expected_version)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;

        row.map(EntityRow::into_entity).transpose()
    }

    async fn soft_delete_if_version(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        id: &str,
        expected_version: Option<i64>,
    ) -> Result<Option<SyncedEntity>, StoreError> {
        let timestamp = encode_timestamp(&now());

        let query = format!(
            r#"
            UPDATE {}
            SET deleted_at = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND organization_id = ? AND deleted_at IS NULL
              AND (? IS NULL OR version = ?)
            RETURNING {COLUMNS}
            "#,
            entity_type.table()
        );

        let row = sqlx::query_as::<_, EntityRow>(&query)
            .bind(&timestamp)
            .bind(&timestamp)
            .bind(id)
            .bind(organization_id)
            .bind(expected_version)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;

        row.map(EntityRow::into_entity).transpose()
    }
}

/// Map a failed insert, surfacing uniqueness violations as duplicates
fn write_error(entity_type: EntityType, key: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() || db_err.message().contains("UNIQUE constraint failed") {
            return StoreError::Duplicate {
                entity_type: entity_type.to_string(),
                key: key.to_string(),
            };
        }
    }
    StoreError::Database(err)
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    organization_id: String,
    user_id: Option<String>,
    client_id: Option<String>,
    version: i64,
    data: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl EntityRow {
    fn into_entity(self) -> Result<SyncedEntity, StoreError> {
        let fields = match serde_json::from_str::<Value>(&self.data)? {
            Value::Object(map) => map,
            _ => {
                return Err(StoreError::CorruptRow(format!(
                    "data column of {} is not an object",
                    self.id
                )))
            }
        };

        let parse = |raw: &str| {
            decode_timestamp(raw)
                .map_err(|e| StoreError::CorruptRow(format!("bad timestamp {raw:?}: {e}")))
        };

        Ok(SyncedEntity {
            created_at: parse(&self.created_at)?,
            updated_at: parse(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(parse).transpose()?,
            id: self.id,
            organization_id: self.organization_id,
            user_id: self.user_id,
            client_id: self.client_id,
            version: self.version,
            fields,
        })
    }
}
