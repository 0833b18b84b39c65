//! Change applier (push side)
//!
//! Applies a batch of client mutations one record at a time. Each record ends
//! up in exactly one of `applied`, `conflicts` or `errors`; a failing record
//! never stops the rest of the batch.

use serde_json::{json, Value};

use super::types::{
    AppliedChange, ChangeOperation, ChangeRecord, ConflictEntry, ConflictType, ErrorEntry,
    PushOutcome, PushStats,
};
use crate::entities::{merge_fields, sanitize_fields, EntityStore, EntityType, NewEntity, SyncedEntity};
use crate::error::{AppError, Result, StoreError};
use crate::events::{ChangeKind, EventBus, Exclude};
use crate::identity::DeviceIdentity;

/// What happened to one record
enum RecordOutcome {
    Applied {
        server_id: String,
        server_version: i64,
        already_deleted: bool,
        change: Option<(ChangeKind, SyncedEntity)>,
    },
    Conflict {
        kind: ConflictType,
        message: String,
        server_data: Option<Value>,
    },
}

impl RecordOutcome {
    fn applied(kind: ChangeKind, entity: SyncedEntity) -> Self {
        RecordOutcome::Applied {
            server_id: entity.id.clone(),
            server_version: entity.version,
            already_deleted: false,
            change: Some((kind, entity)),
        }
    }

    fn already_deleted(server_id: String, server_version: i64) -> Self {
        RecordOutcome::Applied {
            server_id,
            server_version,
            already_deleted: true,
            change: None,
        }
    }

    fn conflict(kind: ConflictType, server: Option<&SyncedEntity>) -> Self {
        let message = match kind {
            ConflictType::VersionMismatch => "Entity was modified by another client",
            ConflictType::EntityNotFound => "Entity not found on server",
            ConflictType::DuplicateEntity => "Entity already exists",
        };
        RecordOutcome::Conflict {
            kind,
            message: message.to_string(),
            server_data: server.map(SyncedEntity::to_json),
        }
    }
}

/// Applies client-originated change batches to the entity store
pub struct ChangeApplier<'a> {
    store: &'a dyn EntityStore,
    events: &'a EventBus,
}

impl<'a> ChangeApplier<'a> {
    pub fn new(store: &'a dyn EntityStore, events: &'a EventBus) -> Self {
        Self { store, events }
    }

    /// Apply every record of a batch in order
    pub async fn apply_batch(
        &self,
        identity: &DeviceIdentity,
        changes: Vec<ChangeRecord>,
    ) -> PushOutcome {
        let mut outcome = PushOutcome {
            stats: PushStats {
                total: changes.len(),
                ..Default::default()
            },
            ..Default::default()
        };

        for change in changes {
            match self.apply_one(identity, &change).await {
                Ok(RecordOutcome::Applied {
                    server_id,
                    server_version,
                    already_deleted,
                    change: mutation,
                }) => {
                    if let Some((kind, entity)) = mutation {
                        self.broadcast(identity, &change, kind, &entity);
                    }
                    outcome.applied.push(AppliedChange {
                        change,
                        server_id,
                        server_version,
                        already_deleted,
                    });
                }
                Ok(RecordOutcome::Conflict {
                    kind,
                    message,
                    server_data,
                }) => {
                    tracing::debug!(
                        "Push conflict {:?} on {} {:?} from {}",
                        kind,
                        change.entity_type,
                        change.entity_id,
                        identity.device_id
                    );
                    outcome.conflicts.push(ConflictEntry {
                        change,
                        conflict: true,
                        kind,
                        message,
                        server_data,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to apply {:?} {} {:?}: {}",
                        change.operation,
                        change.entity_type,
                        change.entity_id,
                        e
                    );
                    outcome.errors.push(ErrorEntry {
                        change,
                        error: e.to_string(),
                    });
                }
            }
        }

        outcome.stats.applied = outcome.applied.len();
        outcome.stats.conflicts = outcome.conflicts.len();
        outcome.stats.errors = outcome.errors.len();

        outcome
    }

    async fn apply_one(
        &self,
        identity: &DeviceIdentity,
        change: &ChangeRecord,
    ) -> Result<RecordOutcome> {
        let entity_type = writable_type(&change.entity_type)?;

        match change.operation {
            ChangeOperation::Create => self.create(entity_type, identity, change).await,
            ChangeOperation::Update => self.update(entity_type, identity, change).await,
            ChangeOperation::Delete => self.delete(entity_type, identity, change).await,
        }
    }

    async fn create(
        &self,
        entity_type: EntityType,
        identity: &DeviceIdentity,
        change: &ChangeRecord,
    ) -> Result<RecordOutcome> {
        let fields = sanitize_fields(change.data.as_ref())?;
        let new_entity = NewEntity {
            id: change.entity_id.clone(),
            organization_id: identity.organization_id.clone(),
            user_id: Some(identity.user_id.clone()),
            client_id: change.client_id.clone(),
            fields,
        };

        match self.store.create(entity_type, new_entity).await {
            Ok(entity) => Ok(RecordOutcome::applied(ChangeKind::Created, entity)),
            Err(StoreError::Duplicate { .. }) => {
                let existing = self
                    .find_existing(entity_type, &identity.organization_id, change)
                    .await?;
                Ok(RecordOutcome::conflict(
                    ConflictType::DuplicateEntity,
                    existing.as_ref(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        entity_type: EntityType,
        identity: &DeviceIdentity,
        change: &ChangeRecord,
    ) -> Result<RecordOutcome> {
        let id = required_id(change)?;
        let org = identity.organization_id.as_str();

        let current = match self.store.find(entity_type, org, id).await? {
            Some(entity) if !entity.is_deleted() => entity,
            tombstone => {
                return Ok(RecordOutcome::conflict(
                    ConflictType::EntityNotFound,
                    tombstone.as_ref(),
                ))
            }
        };

        let version = change.version.ok_or(AppError::VersionRequired)?;
        if version != current.version {
            return Ok(RecordOutcome::conflict(
                ConflictType::VersionMismatch,
                Some(&current),
            ));
        }

        let fields = merge_fields(&current.fields, &sanitize_fields(change.data.as_ref())?);

        match self
            .store
            .update_if_version(entity_type, org, id, Some(version), fields)
            .await?
        {
            Some(updated) => Ok(RecordOutcome::applied(ChangeKind::Updated, updated)),
            // Lost the race to another writer after the read
            None => {
                let latest = self.store.find(entity_type, org, id).await?;
                Ok(RecordOutcome::conflict(
                    ConflictType::VersionMismatch,
                    latest.as_ref(),
                ))
            }
        }
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        identity: &DeviceIdentity,
        change: &ChangeRecord,
    ) -> Result<RecordOutcome> {
        let id = required_id(change)?;
        let org = identity.organization_id.as_str();

        let current = match self.store.find(entity_type, org, id).await? {
            None => {
                return Ok(RecordOutcome::already_deleted(
                    id.to_string(),
                    change.version.unwrap_or_default(),
                ))
            }
            Some(entity) => entity,
        };

        if current.is_deleted() {
            return Ok(deleted_outcome(change, &current));
        }

        let version = change.version.ok_or(AppError::VersionRequired)?;
        if version != current.version {
            return Ok(RecordOutcome::conflict(
                ConflictType::VersionMismatch,
                Some(&current),
            ));
        }

        match self
            .store
            .soft_delete_if_version(entity_type, org, id, Some(version))
            .await?
        {
            Some(deleted) => Ok(RecordOutcome::applied(ChangeKind::Deleted, deleted)),
            None => match self.store.find(entity_type, org, id).await? {
                Some(latest) if latest.is_deleted() => Ok(deleted_outcome(change, &latest)),
                latest => Ok(RecordOutcome::conflict(
                    ConflictType::VersionMismatch,
                    latest.as_ref(),
                )),
            },
        }
    }

    /// Existing entity behind a duplicate create
    async fn find_existing(
        &self,
        entity_type: EntityType,
        organization_id: &str,
        change: &ChangeRecord,
    ) -> Result<Option<SyncedEntity>> {
        if let Some(client_id) = &change.client_id {
            if let Some(found) = self
                .store
                .find_by_client_id(entity_type, organization_id, client_id)
                .await?
            {
                return Ok(Some(found));
            }
        }

        match &change.entity_id {
            Some(id) => Ok(self.store.find(entity_type, organization_id, id).await?),
            None => Ok(None),
        }
    }

    fn broadcast(
        &self,
        identity: &DeviceIdentity,
        change: &ChangeRecord,
        kind: ChangeKind,
        entity: &SyncedEntity,
    ) {
        let Ok(entity_type) = change.entity_type.parse::<EntityType>() else {
            return;
        };
        self.events.entity_changed(
            entity_type,
            kind,
            entity,
            json!({"userId": identity.user_id, "deviceId": identity.device_id}),
            Some(Exclude::Device(identity.device_id.clone())),
        );
    }
}

/// Parse an entity type that devices are allowed to write
pub fn writable_type(raw: &str) -> Result<EntityType> {
    let entity_type = raw
        .parse::<EntityType>()
        .map_err(|_| AppError::UnsupportedEntityType(raw.to_string()))?;

    if !entity_type.accepts_client_writes() {
        return Err(AppError::UnsupportedEntityType(format!(
            "{raw} is read-only for devices"
        )));
    }

    Ok(entity_type)
}

fn required_id(change: &ChangeRecord) -> Result<&str> {
    change
        .entity_id
        .as_deref()
        .ok_or_else(|| AppError::BadRequest(format!("entityId is required for {:?}", change.operation)))
}

/// Deleting a tombstone is idempotent unless the client's version predates
/// the last live version
fn deleted_outcome(change: &ChangeRecord, tombstone: &SyncedEntity) -> RecordOutcome {
    match change.version {
        Some(version) if version < tombstone.version - 1 => {
            RecordOutcome::conflict(ConflictType::VersionMismatch, Some(tombstone))
        }
        _ => RecordOutcome::already_deleted(tombstone.id.clone(), tombstone.version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;
    use crate::entities::SqliteEntityStore;

    async fn setup_store() -> SqliteEntityStore {
        SqliteEntityStore::new(create_memory_pool().await.unwrap())
    }

    fn device() -> DeviceIdentity {
        DeviceIdentity {
            user_id: "user-1".to_string(),
            organization_id: "org-1".to_string(),
            device_id: "device-a".to_string(),
            platform: None,
            app_version: None,
        }
    }

    fn record(
        entity_type: &str,
        operation: ChangeOperation,
        entity_id: Option<&str>,
        version: Option<i64>,
        data: Value,
    ) -> ChangeRecord {
        ChangeRecord {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.map(str::to_string),
            operation,
            data: Some(data),
            version,
            client_id: None,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_create_update_delete_bump_versions() {
        let store = setup_store().await;
        let events = EventBus::new();
        let applier = ChangeApplier::new(&store, &events);

        let created = applier
            .apply_batch(
                &device(),
                vec![record("reservation", ChangeOperation::Create, Some("r-1"), None, json!({"partySize": 2}))],
            )
            .await;
        assert_eq!(created.applied[0].server_id, "r-1");
        assert_eq!(created.applied[0].server_version, 1);

        let updated = applier
            .apply_batch(
                &device(),
                vec![record("reservation", ChangeOperation::Update, Some("r-1"), Some(1), json!({"note": "window"}))],
            )
            .await;
        assert_eq!(updated.applied[0].server_version, 2);

        let entity = store
            .find(EntityType::Reservation, "org-1", "r-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.fields["partySize"], 2);
        assert_eq!(entity.fields["note"], "window");

        let deleted = applier
            .apply_batch(
                &device(),
                vec![record("reservation", ChangeOperation::Delete, Some("r-1"), Some(2), Value::Null)],
            )
            .await;
        assert_eq!(deleted.applied[0].server_version, 3);
        assert!(!deleted.applied[0].already_deleted);
    }

    #[tokio::test]
    async fn test_stale_update_is_a_conflict_with_server_data() {
        let store = setup_store().await;
        let events = EventBus::new();
        let applier = ChangeApplier::new(&store, &events);

        applier
            .apply_batch(
                &device(),
                vec![
                    record("order", ChangeOperation::Create, Some("o-1"), None, json!({"total": 10})),
                    record("order", ChangeOperation::Update, Some("o-1"), Some(1), json!({"total": 12})),
                ],
            )
            .await;

        let stale = applier
            .apply_batch(
                &device(),
                vec![record("order", ChangeOperation::Update, Some("o-1"), Some(1), json!({"total": 99}))],
            )
            .await;

        assert!(stale.applied.is_empty());
        let conflict = &stale.conflicts[0];
        assert_eq!(conflict.kind, ConflictType::VersionMismatch);
        assert_eq!(conflict.server_data.as_ref().unwrap()["version"], 2);
        assert_eq!(conflict.server_data.as_ref().unwrap()["total"], 12);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = setup_store().await;
        let events = EventBus::new();
        let applier = ChangeApplier::new(&store, &events);

        let missing = applier
            .apply_batch(
                &device(),
                vec![record("customer", ChangeOperation::Delete, Some("nobody"), Some(1), Value::Null)],
            )
            .await;
        assert!(missing.applied[0].already_deleted);

        applier
            .apply_batch(
                &device(),
                vec![record("customer", ChangeOperation::Create, Some("c-1"), None, json!({}))],
            )
            .await;
        let delete = record("customer", ChangeOperation::Delete, Some("c-1"), Some(1), Value::Null);
        let first = applier.apply_batch(&device(), vec![delete.clone()]).await;
        let second = applier.apply_batch(&device(), vec![delete]).await;

        assert!(!first.applied[0].already_deleted);
        assert!(second.applied[0].already_deleted);
        assert_eq!(second.applied[0].server_version, 2);
        assert!(second.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_update_of_tombstone_is_not_found() {
        let store = setup_store().await;
        let events = EventBus::new();
        let applier = ChangeApplier::new(&store, &events);

        applier
            .apply_batch(
                &device(),
                vec![
                    record("order", ChangeOperation::Create, Some("o-1"), None, json!({})),
                    record("order", ChangeOperation::Delete, Some("o-1"), Some(1), Value::Null),
                ],
            )
            .await;

        let outcome = applier
            .apply_batch(
                &device(),
                vec![record("order", ChangeOperation::Update, Some("o-1"), Some(2), json!({"total": 1}))],
            )
            .await;
        assert_eq!(outcome.conflicts[0].kind, ConflictType::EntityNotFound);
        assert!(outcome.conflicts[0].server_data.as_ref().unwrap()["deletedAt"].is_string());
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let store = setup_store().await;
        let events = EventBus::new();
        let applier = ChangeApplier::new(&store, &events);

        let outcome = applier
            .apply_batch(
                &device(),
                vec![
                    record("reservation", ChangeOperation::Create, None, None, json!({"partySize": 4})),
                    record("spaceship", ChangeOperation::Create, None, None, json!({})),
                    record("menuItem", ChangeOperation::Create, None, None, json!({})),
                    record("reservation", ChangeOperation::Update, Some("missing"), Some(1), json!({})),
                    record("order", ChangeOperation::Create, None, None, json!([1, 2])),
                    record("customer", ChangeOperation::Create, None, None, json!({"name": "Ada"})),
                ],
            )
            .await;

        assert_eq!(
            outcome.stats,
            PushStats {
                total: 6,
                applied: 2,
                conflicts: 1,
                errors: 3
            }
        );
        assert_eq!(outcome.errors[0].change.entity_type, "spaceship");
        assert_eq!(outcome.conflicts[0].kind, ConflictType::EntityNotFound);
    }

    #[tokio::test]
    async fn test_duplicate_client_id_returns_existing() {
        let store = setup_store().await;
        let events = EventBus::new();
        let applier = ChangeApplier::new(&store, &events);

        let mut create = record("reservation", ChangeOperation::Create, None, None, json!({"partySize": 2}));
        create.client_id = Some("tmp-42".to_string());

        let first = applier.apply_batch(&device(), vec![create.clone()]).await;
        let second = applier.apply_batch(&device(), vec![create]).await;

        let conflict = &second.conflicts[0];
        assert_eq!(conflict.kind, ConflictType::DuplicateEntity);
        assert_eq!(
            conflict.server_data.as_ref().unwrap()["id"],
            first.applied[0].server_id.as_str()
        );
    }

    #[tokio::test]
    async fn test_applied_changes_are_broadcast_excluding_device() {
        let store = setup_store().await;
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let applier = ChangeApplier::new(&store, &events);

        applier
            .apply_batch(
                &device(),
                vec![record("order", ChangeOperation::Create, Some("o-1"), None, json!({}))],
            )
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "order_created");
        assert_eq!(event.exclude, Some(Exclude::Device("device-a".to_string())));
    }
}
