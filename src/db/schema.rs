//! Database schema initialization

use sqlx::SqlitePool;

use crate::entities::EntityType;
use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SYNC_SCHEMA_SQL).execute(pool).await?;

    for entity_type in EntityType::ALL {
        sqlx::query(&entity_table_sql(entity_type.table()))
            .execute(pool)
            .await?;
    }

    Ok(())
}

const SYNC_SCHEMA_SQL: &str = r#"
-- One row per (user, device) pair
CREATE TABLE IF NOT EXISTS sync_sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    platform TEXT,
    app_version TEXT,
    last_sync_at TEXT NOT NULL,
    sync_token TEXT NOT NULL,
    conflict_resolution_strategy TEXT NOT NULL DEFAULT 'SERVER_WINS',
    -- In-flight paginated pull (JSON), NULL when no pull is pending
    pull_checkpoint TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    UNIQUE(device_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_sync_sessions_last_sync ON sync_sessions(last_sync_at);

-- Append-only log of tracked sync requests
CREATE TABLE IF NOT EXISTS sync_operations (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'IN_PROGRESS',
    timestamp TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_operations_session ON sync_operations(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_sync_operations_status ON sync_operations(status);
"#;

/// DDL for one synced entity table
///
/// Domain fields live in the `data` JSON column; the sync columns are shared
/// by every entity type.
fn entity_table_sql(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    user_id TEXT,
    client_id TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    data TEXT NOT NULL DEFAULT '{{}}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,

    UNIQUE(organization_id, client_id)
);

CREATE INDEX IF NOT EXISTS idx_{table}_changes ON {table}(organization_id, updated_at, id);
"#
    )
}
