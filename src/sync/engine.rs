//! Sync engine
//!
//! Entry point for the sync endpoints. Ties the session registry, change log
//! reader, change applier, conflict resolver and operation log together and
//! serializes work per device.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use super::applier::ChangeApplier;
use super::change_log::ChangeLogReader;
use super::conflict::ConflictResolver;
use super::locks::SessionLocks;
use super::oplog::OperationLog;
use super::session::{generate_sync_token, SessionRepository};
use super::types::{
    ChangeRecord, ConflictEntry, ConflictResolutionStrategy, PullCheckpoint, PullOutcome,
    PushOutcome, Resolution, ResolveOutcome, SyncSession, SyncStatus,
};
use crate::config::SyncConfig;
use crate::db::now;
use crate::entities::{ChangePosition, EntityStore, EntityType};
use crate::error::Result;
use crate::events::EventBus;
use crate::identity::DeviceIdentity;

/// Operation-log rows included in a status snapshot
const STATUS_OPERATIONS: u32 = 10;

/// Result of a push, with the token the device should keep
#[derive(Debug, Clone)]
pub struct PushResult {
    pub outcome: PushOutcome,
    pub sync_token: String,
    pub server_time: DateTime<Utc>,
}

/// What a housekeeping pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HousekeepingReport {
    pub sessions: u64,
    pub operations: u64,
    pub locks: usize,
}

/// Sync service shared by all requests
#[derive(Clone)]
pub struct SyncEngine {
    pool: SqlitePool,
    store: Arc<dyn EntityStore>,
    events: EventBus,
    locks: SessionLocks,
    oplog: OperationLog,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        store: Arc<dyn EntityStore>,
        events: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            oplog: OperationLog::new(pool.clone()),
            pool,
            store,
            events,
            locks: SessionLocks::new(),
            config,
        }
    }

    pub fn sessions(&self) -> SessionRepository<'_> {
        SessionRepository::new(&self.pool)
    }

    pub fn operations(&self) -> &OperationLog {
        &self.oplog
    }

    /// Deliver changes since the device's cursor (or `since_override`).
    ///
    /// A pull that does not fit in one page stores a checkpoint and leaves
    /// the cursor alone; the next pull continues from the checkpoint. A pull
    /// filtered to some entity types never moves the cursor.
    pub async fn pull(
        &self,
        identity: &DeviceIdentity,
        since_override: Option<DateTime<Utc>>,
        entity_types: Option<Vec<EntityType>>,
    ) -> Result<PullOutcome> {
        let _guard = self.locks.acquire(&identity.user_id, &identity.device_id).await;
        let sessions = self.sessions();
        let session = sessions.get_or_create(identity).await?;
        let operation = self.oplog.begin(&session.id, "PULL", "/sync/pull").await;

        let started_at = now();
        let plan = PullPlan::new(&session, since_override, entity_types, started_at);

        let reader = ChangeLogReader::new(self.store.as_ref(), self.config.pull_page_size);
        let page = reader
            .read(
                &identity.organization_id,
                &plan.entity_types,
                plan.since,
                &plan.positions,
            )
            .await?;

        // Only a pull over every type may move the cursor; a filtered pull
        // leaves it for the types it skipped
        let sync_token = generate_sync_token();
        let (last_sync_at, checkpoint) = if page.has_more {
            let checkpoint = PullCheckpoint {
                since: plan.since,
                started_at: plan.started_at,
                entity_types: plan.entity_types.clone(),
                positions: page.positions,
            };
            (session.last_sync_at, Some(checkpoint))
        } else if plan.covers_all() {
            (plan.started_at, None)
        } else if plan.resumed {
            (session.last_sync_at, None)
        } else {
            (session.last_sync_at, session.pull_checkpoint.clone())
        };
        sessions
            .advance(&session.id, &sync_token, last_sync_at, checkpoint.as_ref())
            .await?;

        self.oplog.complete_detached(operation);

        tracing::info!(
            "Pull for {}/{}: {} changes, {} deletions, has_more: {}",
            identity.user_id,
            identity.device_id,
            page.changes.values().map(Vec::len).sum::<usize>(),
            page.deletions.len(),
            page.has_more
        );

        Ok(PullOutcome {
            changes: page.changes,
            deletions: page.deletions,
            sync_token,
            server_time: started_at,
            has_more: page.has_more,
        })
    }

    /// Apply a batch of client changes.
    ///
    /// The token rotates only when something was applied; the cursor never
    /// moves on push.
    pub async fn push(
        &self,
        identity: &DeviceIdentity,
        changes: Vec<ChangeRecord>,
        client_token: Option<&str>,
    ) -> Result<PushResult> {
        let _guard = self.locks.acquire(&identity.user_id, &identity.device_id).await;
        let sessions = self.sessions();
        let session = sessions.get_or_create(identity).await?;
        let operation = self.oplog.begin(&session.id, "PUSH", "/sync/push").await;

        if let Some(token) = client_token {
            if token != session.sync_token {
                tracing::debug!(
                    "Push from {} carries stale sync token {}",
                    identity.device_id,
                    token
                );
            }
        }

        let applier = ChangeApplier::new(self.store.as_ref(), &self.events);
        let outcome = applier.apply_batch(identity, changes).await;

        let sync_token = if outcome.stats.applied > 0 {
            let token = generate_sync_token();
            sessions
                .advance(
                    &session.id,
                    &token,
                    session.last_sync_at,
                    session.pull_checkpoint.as_ref(),
                )
                .await?;
            token
        } else {
            session.sync_token
        };

        self.oplog.complete_detached(operation);

        tracing::info!(
            "Push from {}/{}: {} applied, {} conflicts, {} errors",
            identity.user_id,
            identity.device_id,
            outcome.stats.applied,
            outcome.stats.conflicts,
            outcome.stats.errors
        );

        Ok(PushResult {
            outcome,
            sync_token,
            server_time: now(),
        })
    }

    /// Resolve conflicts from an earlier push.
    ///
    /// Entries without an explicit strategy use the session default.
    pub async fn resolve(
        &self,
        identity: &DeviceIdentity,
        conflicts: Vec<ConflictEntry>,
        resolutions: Vec<Option<Resolution>>,
    ) -> Result<ResolveOutcome> {
        let session = self.sessions().get_or_create(identity).await?;
        let operation = self
            .oplog
            .begin(&session.id, "RESOLVE", "/sync/resolve-conflicts")
            .await;

        let resolver = ConflictResolver::new(self.store.as_ref(), &self.events);
        let outcome = resolver
            .resolve_all(
                identity,
                conflicts,
                resolutions,
                session.conflict_resolution_strategy,
            )
            .await;

        self.oplog.complete_detached(operation);

        tracing::info!(
            "Resolved {} of {} conflicts for {}/{}",
            outcome.stats.resolved,
            outcome.stats.total,
            identity.user_id,
            identity.device_id
        );

        Ok(outcome)
    }

    /// Session snapshot with operation-log counters
    pub async fn status(&self, identity: &DeviceIdentity) -> Result<SyncStatus> {
        let session = self.sessions().get_or_create(identity).await?;
        let pending_operations = self.oplog.pending_count(&session.id).await?;
        let recent_operations = self
            .oplog
            .recent_count(&session.id, Duration::hours(1))
            .await?;
        let last_operations = self.oplog.recent(&session.id, STATUS_OPERATIONS).await?;

        Ok(SyncStatus {
            session,
            pending_operations,
            recent_operations,
            last_operations,
            server_time: now(),
        })
    }

    /// Force the next pull to start from the epoch
    pub async fn reset(&self, identity: &DeviceIdentity) -> Result<SyncSession> {
        let _guard = self.locks.acquire(&identity.user_id, &identity.device_id).await;
        let sessions = self.sessions();
        let session = sessions.get_or_create(identity).await?;
        let operation = self.oplog.begin(&session.id, "RESET", "/sync/reset").await;

        let session = sessions.reset(&session.id).await?;
        self.oplog.complete_detached(operation);

        tracing::info!("Reset sync state for {}/{}", identity.user_id, identity.device_id);

        Ok(session)
    }

    /// Change the device's default conflict strategy
    pub async fn update_settings(
        &self,
        identity: &DeviceIdentity,
        strategy: ConflictResolutionStrategy,
    ) -> Result<SyncSession> {
        let sessions = self.sessions();
        let session = sessions.get_or_create(identity).await?;
        let session = sessions.set_strategy(&session.id, strategy).await?;

        tracing::info!(
            "Conflict strategy for {}/{} set to {}",
            identity.user_id,
            identity.device_id,
            strategy
        );

        Ok(session)
    }

    /// Prune idle sessions, old operation rows and unused locks
    pub async fn housekeeping(&self) -> Result<HousekeepingReport> {
        let cutoff = now() - Duration::days(self.config.session_retention_days);

        let sessions = self.sessions().prune_inactive(cutoff).await?;
        let operations = self.oplog.prune(cutoff).await?;
        let locks = self.locks.prune_idle().await;

        Ok(HousekeepingReport {
            sessions,
            operations,
            locks,
        })
    }
}

/// Where a pull starts and which types it covers
struct PullPlan {
    since: DateTime<Utc>,
    started_at: DateTime<Utc>,
    entity_types: Vec<EntityType>,
    positions: BTreeMap<String, ChangePosition>,
    /// Continues the session's pending checkpoint
    resumed: bool,
}

impl PullPlan {
    fn new(
        session: &SyncSession,
        since_override: Option<DateTime<Utc>>,
        requested: Option<Vec<EntityType>>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let requested = normalize_types(requested.unwrap_or_default());

        if let Some(since) = since_override {
            if since < session.last_sync_at {
                tracing::debug!(
                    "Device {} asked for changes since {}, before its cursor {}",
                    session.device_id,
                    since,
                    session.last_sync_at
                );
            }
            return Self::fresh(since, started_at, requested);
        }

        match &session.pull_checkpoint {
            Some(checkpoint) if normalize_types(checkpoint.entity_types.clone()) == requested => Self {
                since: checkpoint.since,
                started_at: checkpoint.started_at,
                entity_types: requested,
                positions: checkpoint.positions.clone(),
                resumed: true,
            },
            _ => Self::fresh(session.last_sync_at, started_at, requested),
        }
    }

    fn fresh(since: DateTime<Utc>, started_at: DateTime<Utc>, entity_types: Vec<EntityType>) -> Self {
        Self {
            since,
            started_at,
            entity_types,
            positions: BTreeMap::new(),
            resumed: false,
        }
    }

    fn covers_all(&self) -> bool {
        self.entity_types.len() == EntityType::ALL.len()
    }
}

/// Sorted, deduplicated; an empty list means every type
fn normalize_types(mut types: Vec<EntityType>) -> Vec<EntityType> {
    if types.is_empty() {
        types = EntityType::ALL.to_vec();
    }
    types.sort();
    types.dedup();
    types
}
