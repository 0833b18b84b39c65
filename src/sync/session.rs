//! Sync session registry
//!
//! One session per (user, device). The session owns the pull cursor
//! (`last_sync_at`), the rotating sync token and the default conflict
//! strategy for that device.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::types::{ConflictResolutionStrategy, PullCheckpoint, SyncSession};
use crate::db::{decode_timestamp, encode_timestamp, epoch, now};
use crate::error::{AppError, Result, StoreError};
use crate::identity::DeviceIdentity;

/// Generate a fresh sync token: `sync_<unix millis>_<9 random chars>`
pub fn generate_sync_token() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("sync_{}_{}", Utc::now().timestamp_millis(), &random[..9])
}

const COLUMNS: &str = "id, user_id, device_id, platform, app_version, last_sync_at, sync_token, \
     conflict_resolution_strategy, pull_checkpoint, created_at, updated_at";

/// Repository for sync sessions
pub struct SessionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SessionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the session for a device, creating it at the epoch cursor on first
    /// contact. Reported platform and app version are refreshed every call.
    pub async fn get_or_create(&self, identity: &DeviceIdentity) -> Result<SyncSession> {
        let timestamp = encode_timestamp(&now());

        let query = format!(
            r#"
            INSERT INTO sync_sessions (
                id, user_id, device_id, platform, app_version, last_sync_at,
                sync_token, conflict_resolution_strategy, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id, user_id) DO UPDATE SET
                platform = COALESCE(excluded.platform, sync_sessions.platform),
                app_version = COALESCE(excluded.app_version, sync_sessions.app_version),
                updated_at = excluded.updated_at
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(Uuid::new_v4().to_string())
            .bind(&identity.user_id)
            .bind(&identity.device_id)
            .bind(&identity.platform)
            .bind(&identity.app_version)
            .bind(encode_timestamp(&epoch()))
            .bind(generate_sync_token())
            .bind(ConflictResolutionStrategy::default().as_str())
            .bind(&timestamp)
            .bind(&timestamp)
            .fetch_one(self.pool)
            .await?;

        row.into_session()
    }

    /// Get a session without creating it
    pub async fn find(&self, user_id: &str, device_id: &str) -> Result<Option<SyncSession>> {
        let query = format!(
            "SELECT {COLUMNS} FROM sync_sessions WHERE user_id = ? AND device_id = ?"
        );

        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(user_id)
            .bind(device_id)
            .fetch_optional(self.pool)
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Rotate the token, move the cursor and replace the pull checkpoint.
    ///
    /// This is the only writer of the cursor and the token. Callers that
    /// must not move the cursor pass the session's current `last_sync_at`.
    pub async fn advance(
        &self,
        session_id: &str,
        sync_token: &str,
        last_sync_at: DateTime<Utc>,
        checkpoint: Option<&PullCheckpoint>,
    ) -> Result<SyncSession> {
        let checkpoint = checkpoint
            .map(serde_json::to_string)
            .transpose()
            .map_err(StoreError::from)?;

        let query = format!(
            r#"
            UPDATE sync_sessions
            SET sync_token = ?, last_sync_at = ?, pull_checkpoint = ?, updated_at = ?
            WHERE id = ?
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(sync_token)
            .bind(encode_timestamp(&last_sync_at))
            .bind(&checkpoint)
            .bind(encode_timestamp(&now()))
            .bind(session_id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("sync session {session_id}")))?;

        row.into_session()
    }

    /// Force a full resync: cursor back to the epoch, fresh token, no checkpoint
    pub async fn reset(&self, session_id: &str) -> Result<SyncSession> {
        self.advance(session_id, &generate_sync_token(), epoch(), None)
            .await
    }

    /// Change the default conflict strategy of a device
    pub async fn set_strategy(
        &self,
        session_id: &str,
        strategy: ConflictResolutionStrategy,
    ) -> Result<SyncSession> {
        let query = format!(
            r#"
            UPDATE sync_sessions
            SET conflict_resolution_strategy = ?, updated_at = ?
            WHERE id = ?
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(strategy.as_str())
            .bind(encode_timestamp(&now()))
            .bind(session_id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("sync session {session_id}")))?;

        row.into_session()
    }

    /// Delete sessions untouched since `cutoff`, along with their operation log
    pub async fn prune_inactive(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = encode_timestamp(&cutoff);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM sync_operations
            WHERE session_id IN (SELECT id FROM sync_sessions WHERE updated_at < ?)
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM sync_sessions WHERE updated_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(deleted)
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    device_id: String,
    platform: Option<String>,
    app_version: Option<String>,
    last_sync_at: String,
    sync_token: String,
    conflict_resolution_strategy: String,
    pull_checkpoint: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<SyncSession> {
        let parse = |raw: &str| {
            decode_timestamp(raw).map_err(|e| {
                AppError::Store(StoreError::CorruptRow(format!("bad timestamp {raw:?}: {e}")))
            })
        };

        let strategy = self
            .conflict_resolution_strategy
            .parse::<ConflictResolutionStrategy>()
            .map_err(|e| AppError::Store(StoreError::CorruptRow(e)))?;

        // A checkpoint that no longer decodes only costs a restart of the pull
        let pull_checkpoint = self.pull_checkpoint.as_deref().and_then(|raw| {
            serde_json::from_str::<PullCheckpoint>(raw)
                .map_err(|e| {
                    tracing::warn!("Discarding unreadable pull checkpoint of {}: {}", self.id, e)
                })
                .ok()
        });

        Ok(SyncSession {
            last_sync_at: parse(&self.last_sync_at)?,
            created_at: parse(&self.created_at)?,
            updated_at: parse(&self.updated_at)?,
            id: self.id,
            user_id: self.user_id,
            device_id: self.device_id,
            platform: self.platform,
            app_version: self.app_version,
            sync_token: self.sync_token,
            conflict_resolution_strategy: strategy,
            pull_checkpoint,
        })
    }
}
