//! Conflict resolution
//!
//! Settles conflicts reported by a push using one of the four strategies.
//! Forced writes are still compare-and-set against the version just read, so
//! a resolution never overwrites a change it has not seen; a lost race is
//! retried a few times before giving up.

use serde_json::{json, Value};

use super::types::{
    ChangeOperation, ConflictEntry, ConflictResolutionStrategy, RemainingConflict, Resolution,
    ResolutionOutcome, ResolveOutcome, ResolveStats, ResolvedChange,
};
use crate::entities::{merge_fields, sanitize_fields, EntityStore, EntityType, NewEntity, SyncedEntity};
use crate::error::{AppError, Result, StoreError};
use crate::events::{ChangeKind, EventBus, Exclude};
use crate::identity::DeviceIdentity;

/// Attempts at a forced write before reporting the conflict again
const MAX_ATTEMPTS: usize = 3;

/// Reason attached to conflicts returned without a resolution
pub const NO_RESOLUTION: &str = "NO_RESOLUTION";
/// Reason attached to conflicts left for manual handling
pub const MANUAL: &str = "MANUAL";

/// Resolves push conflicts against the entity store
pub struct ConflictResolver<'a> {
    store: &'a dyn EntityStore,
    events: &'a EventBus,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(store: &'a dyn EntityStore, events: &'a EventBus) -> Self {
        Self { store, events }
    }

    /// Resolve one conflict. `Ok(None)` means the strategy was `MANUAL`.
    pub async fn resolve(
        &self,
        identity: &DeviceIdentity,
        conflict: &ConflictEntry,
        resolution: &Resolution,
        default_strategy: ConflictResolutionStrategy,
    ) -> Result<Option<ResolvedChange>> {
        let strategy = resolution.strategy.unwrap_or(default_strategy);
        let entity_type = conflict
            .change
            .entity_type
            .parse::<EntityType>()
            .map_err(|_| AppError::UnsupportedEntityType(conflict.change.entity_type.clone()))?;
        let target = Target {
            entity_type,
            id: target_id(conflict),
            client_data: resolution
                .data
                .clone()
                .or_else(|| conflict.change.data.clone()),
        };

        let resolved = match strategy {
            ConflictResolutionStrategy::ServerWins => self.keep_server(identity, &target, conflict).await?,
            ConflictResolutionStrategy::ClientWins => self.apply_client(identity, &target, conflict).await?,
            ConflictResolutionStrategy::Merge => self.merge(identity, &target, conflict).await?,
            ConflictResolutionStrategy::Manual => return Ok(None),
        };

        Ok(Some(ResolvedChange {
            entity_type,
            entity_id: target.id,
            strategy,
            outcome: resolved.outcome,
            server_version: resolved.entity.as_ref().map(|e| e.version),
            data: resolved
                .entity
                .as_ref()
                .map(SyncedEntity::to_json)
                .or(resolved.fallback)
                .unwrap_or(Value::Null),
        }))
    }

    /// Resolve parallel arrays of conflicts and resolutions.
    ///
    /// Entries without a resolution, `MANUAL` entries and entries whose
    /// resolution fails are handed back in `remaining`.
    pub async fn resolve_all(
        &self,
        identity: &DeviceIdentity,
        conflicts: Vec<ConflictEntry>,
        resolutions: Vec<Option<Resolution>>,
        default_strategy: ConflictResolutionStrategy,
    ) -> ResolveOutcome {
        let mut outcome = ResolveOutcome {
            stats: ResolveStats {
                total: conflicts.len(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut resolutions = resolutions.into_iter();

        for conflict in conflicts {
            let Some(resolution) = resolutions.next().flatten() else {
                outcome.remaining.push(RemainingConflict {
                    conflict,
                    reason: NO_RESOLUTION.to_string(),
                });
                continue;
            };

            match self
                .resolve(identity, &conflict, &resolution, default_strategy)
                .await
            {
                Ok(Some(resolved)) => outcome.resolved.push(resolved),
                Ok(None) => outcome.remaining.push(RemainingConflict {
                    conflict,
                    reason: MANUAL.to_string(),
                }),
                Err(e) => {
                    tracing::warn!(
                        "Failed to resolve conflict on {} {:?}: {}",
                        conflict.change.entity_type,
                        conflict.change.entity_id,
                        e
                    );
                    outcome.remaining.push(RemainingConflict {
                        conflict,
                        reason: e.to_string(),
                    });
                }
            }
        }

        outcome.stats.resolved = outcome.resolved.len();
        outcome.stats.remaining = outcome.remaining.len();
        outcome
    }

    /// SERVER_WINS: nothing is written, the current server state is returned
    async fn keep_server(
        &self,
        identity: &DeviceIdentity,
        target: &Target,
        conflict: &ConflictEntry,
    ) -> Result<Resolved> {
        let current = match &target.id {
            Some(id) => {
                self.store
                    .find(target.entity_type, &identity.organization_id, id)
                    .await?
            }
            None => None,
        };

        Ok(Resolved {
            outcome: ResolutionOutcome::KeptServer,
            entity: current,
            fallback: conflict.server_data.clone(),
        })
    }

    /// CLIENT_WINS: the client payload is written over the current fields, or
    /// the client's delete goes through, regardless of the version it saw
    async fn apply_client(
        &self,
        identity: &DeviceIdentity,
        target: &Target,
        conflict: &ConflictEntry,
    ) -> Result<Resolved> {
        ensure_writable(target.entity_type)?;
        let org = identity.organization_id.as_str();
        let fields = sanitize_fields(target.client_data.as_ref())?;
        let deleting = conflict.change.operation == ChangeOperation::Delete;

        for _ in 0..MAX_ATTEMPTS {
            let current = self.current(target, org).await?;

            let written = match current {
                None if deleting => {
                    return Ok(Resolved::applied(None));
                }
                None => match self
                    .store
                    .create(
                        target.entity_type,
                        NewEntity {
                            id: target.id.clone(),
                            organization_id: org.to_string(),
                            user_id: Some(identity.user_id.clone()),
                            client_id: conflict.change.client_id.clone(),
                            fields: fields.clone(),
                        },
                    )
                    .await
                {
                    Ok(created) => Some((ChangeKind::Created, created)),
                    // Someone created it in between, go around again
                    Err(StoreError::Duplicate { .. }) => None,
                    Err(e) => return Err(e.into()),
                },
                Some(entity) if entity.is_deleted() => {
                    if deleting {
                        return Ok(Resolved::applied(Some(entity)));
                    }
                    return Err(deleted_error(target.entity_type, &entity));
                }
                Some(entity) if deleting => self
                    .store
                    .soft_delete_if_version(target.entity_type, org, &entity.id, Some(entity.version))
                    .await?
                    .map(|deleted| (ChangeKind::Deleted, deleted)),
                Some(entity) => self
                    .store
                    .update_if_version(
                        target.entity_type,
                        org,
                        &entity.id,
                        Some(entity.version),
                        merge_fields(&entity.fields, &fields),
                    )
                    .await?
                    .map(|updated| (ChangeKind::Updated, updated)),
            };

            if let Some((kind, entity)) = written {
                self.broadcast(identity, target.entity_type, kind, &entity);
                return Ok(Resolved::applied(Some(entity)));
            }
        }

        self.exhausted(target, org, conflict).await
    }

    /// MERGE: server fields, then client fields on top
    async fn merge(
        &self,
        identity: &DeviceIdentity,
        target: &Target,
        conflict: &ConflictEntry,
    ) -> Result<Resolved> {
        ensure_writable(target.entity_type)?;
        let org = identity.organization_id.as_str();

        // A delete carries no fields to merge
        if conflict.change.operation == ChangeOperation::Delete {
            return self.keep_server(identity, target, conflict).await;
        }

        let client_fields = sanitize_fields(target.client_data.as_ref())?;

        for _ in 0..MAX_ATTEMPTS {
            let current = match self.current(target, org).await? {
                // Nothing on the server to merge with: the client data stands alone
                None => return self.apply_client(identity, target, conflict).await,
                Some(entity) if entity.is_deleted() => {
                    return Err(deleted_error(target.entity_type, &entity))
                }
                Some(entity) => entity,
            };

            let merged = merge_fields(&current.fields, &client_fields);
            if let Some(updated) = self
                .store
                .update_if_version(target.entity_type, org, &current.id, Some(current.version), merged)
                .await?
            {
                self.broadcast(identity, target.entity_type, ChangeKind::Updated, &updated);
                return Ok(Resolved {
                    outcome: ResolutionOutcome::Merged,
                    entity: Some(updated),
                    fallback: None,
                });
            }
        }

        self.exhausted(target, org, conflict).await
    }

    async fn current(&self, target: &Target, org: &str) -> Result<Option<SyncedEntity>> {
        match &target.id {
            Some(id) => Ok(self.store.find(target.entity_type, org, id).await?),
            None => Ok(None),
        }
    }

    /// The entity kept moving under us; report the latest state as a conflict
    async fn exhausted(&self, target: &Target, org: &str, conflict: &ConflictEntry) -> Result<Resolved> {
        let latest = self.current(target, org).await?;
        Err(AppError::VersionConflict {
            client_version: conflict.change.version.unwrap_or_default(),
            server_version: latest.as_ref().map(|e| e.version).unwrap_or_default(),
            server_data: latest.as_ref().map(SyncedEntity::to_json).unwrap_or(Value::Null),
        })
    }

    fn broadcast(
        &self,
        identity: &DeviceIdentity,
        entity_type: EntityType,
        kind: ChangeKind,
        entity: &SyncedEntity,
    ) {
        self.events.entity_changed(
            entity_type,
            kind,
            entity,
            json!({"userId": identity.user_id, "deviceId": identity.device_id}),
            Some(Exclude::Device(identity.device_id.clone())),
        );
    }
}

struct Target {
    entity_type: EntityType,
    id: Option<String>,
    client_data: Option<Value>,
}

struct Resolved {
    outcome: ResolutionOutcome,
    entity: Option<SyncedEntity>,
    /// Used when the entity could not be read back
    fallback: Option<Value>,
}

impl Resolved {
    fn applied(entity: Option<SyncedEntity>) -> Self {
        Self {
            outcome: ResolutionOutcome::AppliedClient,
            entity,
            fallback: None,
        }
    }
}

/// Entity id of a conflict, taken from the server copy for duplicate creates
fn target_id(conflict: &ConflictEntry) -> Option<String> {
    conflict.change.entity_id.clone().or_else(|| {
        conflict
            .server_data
            .as_ref()
            .and_then(|data| data.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

fn ensure_writable(entity_type: EntityType) -> Result<()> {
    if entity_type.accepts_client_writes() {
        Ok(())
    } else {
        Err(AppError::UnsupportedEntityType(format!(
            "{entity_type} is read-only for devices"
        )))
    }
}

fn deleted_error(entity_type: EntityType, entity: &SyncedEntity) -> AppError {
    AppError::BadRequest(format!(
        "{entity_type} {} has been deleted and cannot be modified",
        entity.id
    ))
}
