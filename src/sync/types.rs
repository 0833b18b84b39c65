//! Sync data types
//!
//! Defines the wire shapes of the sync protocol:
//! - Change records exchanged on pull and push
//! - Per-record push outcomes (applied, conflict, error)
//! - Conflict resolution requests and results
//! - Session and operation-log records

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{ChangePosition, EntityType};

/// Types of change operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

/// A single mutation, client-originated on push or server-originated on pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Kept as a string so an unknown type fails one record, not the batch
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub operation: ChangeOperation,
    /// Partial payload on push, full entity on pull
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Server version the client last saw
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Dedup key for creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Why a change could not be applied as submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    VersionMismatch,
    EntityNotFound,
    DuplicateEntity,
}

/// A change that was written to the store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedChange {
    #[serde(flatten)]
    pub change: ChangeRecord,
    pub server_id: String,
    pub server_version: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub already_deleted: bool,
}

/// A change that conflicts with server state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    #[serde(flatten)]
    pub change: ChangeRecord,
    #[serde(default = "conflict_flag")]
    pub conflict: bool,
    #[serde(rename = "type")]
    pub kind: ConflictType,
    pub message: String,
    /// Current server entity, when one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data: Option<Value>,
}

fn conflict_flag() -> bool {
    true
}

/// A change that failed unexpectedly
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    #[serde(flatten)]
    pub change: ChangeRecord,
    pub error: String,
}

/// Counters for a push batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushStats {
    pub total: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub errors: usize,
}

/// Result of applying a push batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    pub applied: Vec<AppliedChange>,
    pub conflicts: Vec<ConflictEntry>,
    pub errors: Vec<ErrorEntry>,
    pub stats: PushStats,
}

/// A soft-deleted entity delivered on pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub version: i64,
    pub deleted_at: DateTime<Utc>,
}

/// Result of a pull
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullOutcome {
    /// Change lists keyed by collection name (`reservations`, `orders`, ...)
    pub changes: BTreeMap<String, Vec<ChangeRecord>>,
    pub deletions: Vec<Tombstone>,
    pub sync_token: String,
    pub server_time: DateTime<Utc>,
    pub has_more: bool,
}

/// How to resolve a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolutionStrategy {
    /// Keep the server version
    #[default]
    ServerWins,
    /// Force the client version
    ClientWins,
    /// Server fields, then client fields on top
    Merge,
    /// Leave it to the caller
    Manual,
}

impl ConflictResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolutionStrategy::ServerWins => "SERVER_WINS",
            ConflictResolutionStrategy::ClientWins => "CLIENT_WINS",
            ConflictResolutionStrategy::Merge => "MERGE",
            ConflictResolutionStrategy::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ConflictResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SERVER_WINS" => Ok(ConflictResolutionStrategy::ServerWins),
            "CLIENT_WINS" => Ok(ConflictResolutionStrategy::ClientWins),
            "MERGE" => Ok(ConflictResolutionStrategy::Merge),
            "MANUAL" => Ok(ConflictResolutionStrategy::Manual),
            other => Err(format!("unknown conflict resolution strategy: {other}")),
        }
    }
}

/// Client decision for one conflict
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// Falls back to the session's strategy when omitted
    #[serde(default)]
    pub strategy: Option<ConflictResolutionStrategy>,
    /// Replacement client data; defaults to the conflicting change's data
    #[serde(default)]
    pub data: Option<Value>,
}

/// What the resolver did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionOutcome {
    KeptServer,
    AppliedClient,
    Merged,
}

/// A conflict that has been settled
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedChange {
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub strategy: ConflictResolutionStrategy,
    pub outcome: ResolutionOutcome,
    /// Final entity state, `null` if the entity no longer exists
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<i64>,
}

/// A conflict handed back to the caller unresolved
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemainingConflict {
    #[serde(flatten)]
    pub conflict: ConflictEntry,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveStats {
    pub total: usize,
    pub resolved: usize,
    pub remaining: usize,
}

/// Result of bulk conflict resolution
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOutcome {
    pub resolved: Vec<ResolvedChange>,
    pub remaining: Vec<RemainingConflict>,
    pub stats: ResolveStats,
}

/// Server-side record of one (user, device) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub platform: Option<String>,
    pub app_version: Option<String>,
    /// Pull cursor
    pub last_sync_at: DateTime<Utc>,
    pub sync_token: String,
    pub conflict_resolution_strategy: ConflictResolutionStrategy,
    #[serde(skip)]
    pub pull_checkpoint: Option<PullCheckpoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// State of a pull that is being delivered over several pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullCheckpoint {
    /// Cursor the paginated pull started from
    pub since: DateTime<Utc>,
    /// Read-start instant of the first page; becomes the cursor at the end
    pub started_at: DateTime<Utc>,
    pub entity_types: Vec<EntityType>,
    /// Last delivered position per entity type
    pub positions: BTreeMap<String, ChangePosition>,
}

/// Lifecycle of a tracked sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    InProgress,
    Completed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::InProgress => "IN_PROGRESS",
            OperationStatus::Completed => "COMPLETED",
        }
    }
}

/// One row of the sync operation log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    pub session_id: String,
    pub operation: String,
    pub endpoint: String,
    pub status: OperationStatus,
    pub timestamp: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Session snapshot returned by the status endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub session: SyncSession,
    /// Tracked requests that never completed
    pub pending_operations: i64,
    /// Tracked requests started in the last hour
    pub recent_operations: i64,
    /// Latest tracked requests, newest first
    pub last_operations: Vec<SyncOperation>,
    pub server_time: DateTime<Utc>,
}
