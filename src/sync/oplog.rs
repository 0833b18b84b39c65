//! Sync operation log
//!
//! Append-only diagnostics for tracked sync requests. Writes here never fail
//! the request they describe: errors are logged and swallowed.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::types::{OperationStatus, SyncOperation};
use crate::db::{decode_timestamp, encode_timestamp, now};
use crate::error::Result;

/// Handle to the `sync_operations` table
#[derive(Clone)]
pub struct OperationLog {
    pool: SqlitePool,
}

impl OperationLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the start of a request; `None` if the row could not be written.
    ///
    /// The insert is awaited so the row exists before `complete` can update it.
    pub async fn begin(&self, session_id: &str, operation: &str, endpoint: &str) -> Option<String> {
        let id = Uuid::new_v4().to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO sync_operations (id, session_id, operation, endpoint, status, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(operation)
        .bind(endpoint)
        .bind(OperationStatus::InProgress.as_str())
        .bind(encode_timestamp(&now()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Some(id),
            Err(e) => {
                tracing::warn!("Failed to record sync operation {} {}: {}", operation, endpoint, e);
                None
            }
        }
    }

    /// Mark a request as completed
    pub async fn complete(&self, operation_id: &str) {
        let result = sqlx::query(
            "UPDATE sync_operations SET status = ?, completed_at = ? WHERE id = ?",
        )
        .bind(OperationStatus::Completed.as_str())
        .bind(encode_timestamp(&now()))
        .bind(operation_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!("Failed to complete sync operation {}: {}", operation_id, e);
        }
    }

    /// Complete without waiting for the write
    pub fn complete_detached(&self, operation_id: Option<String>) {
        let Some(operation_id) = operation_id else {
            return;
        };
        let log = self.clone();
        tokio::spawn(async move {
            log.complete(&operation_id).await;
        });
    }

    /// Requests of a session that never completed
    pub async fn pending_count(&self, session_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sync_operations WHERE session_id = ? AND status = ?",
        )
        .bind(session_id)
        .bind(OperationStatus::InProgress.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Requests of a session started within the last `window`
    pub async fn recent_count(&self, session_id: &str, window: Duration) -> Result<i64> {
        let since = encode_timestamp(&(now() - window));

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sync_operations WHERE session_id = ? AND timestamp >= ?",
        )
        .bind(session_id)
        .bind(&since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Most recent operations of a session, newest first
    pub async fn recent(&self, session_id: &str, limit: u32) -> Result<Vec<SyncOperation>> {
        let rows = sqlx::query_as::<_, OperationRow>(
            r#"
            SELECT id, session_id, operation, endpoint, status, timestamp, completed_at
            FROM sync_operations
            WHERE session_id = ?
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(OperationRow::into_operation).collect())
    }

    /// Delete log rows older than `cutoff`
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM sync_operations WHERE timestamp < ?")
            .bind(encode_timestamp(&cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted)
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    session_id: String,
    operation: String,
    endpoint: String,
    status: String,
    timestamp: String,
    completed_at: Option<String>,
}

impl OperationRow {
    /// Diagnostics only, so malformed rows are skipped
    fn into_operation(self) -> Option<SyncOperation> {
        let status = match self.status.as_str() {
            "COMPLETED" => OperationStatus::Completed,
            _ => OperationStatus::InProgress,
        };

        Some(SyncOperation {
            timestamp: decode_timestamp(&self.timestamp).ok()?,
            completed_at: self
                .completed_at
                .as_deref()
                .and_then(|raw| decode_timestamp(raw).ok()),
            id: self.id,
            session_id: self.session_id,
            operation: self.operation,
            endpoint: self.endpoint,
            status,
        })
    }
}
