//! Change log reader (pull side)
//!
//! There is no separate journal: the entity tables themselves are the change
//! log. A row belongs to a pull when its `(updated_at, id)` is past the
//! device's position, and soft-deleted rows are reported as deletions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::types::{ChangeOperation, ChangeRecord, Tombstone};
use crate::entities::{ChangePosition, EntityStore, EntityType, SyncedEntity};
use crate::error::Result;

/// One page of changes for a set of entity types
#[derive(Debug, Default)]
pub struct ChangePage {
    /// Keyed by collection name; every requested type has an entry
    pub changes: BTreeMap<String, Vec<ChangeRecord>>,
    pub deletions: Vec<Tombstone>,
    /// Last delivered position per entity type, keyed by wire name
    pub positions: BTreeMap<String, ChangePosition>,
    /// At least one type had more rows than fit in the page
    pub has_more: bool,
}

/// Reads entity mutations past a cursor, one bounded page at a time
pub struct ChangeLogReader<'a> {
    store: &'a dyn EntityStore,
    page_size: u32,
}

impl<'a> ChangeLogReader<'a> {
    pub fn new(store: &'a dyn EntityStore, page_size: u32) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Read the next page for `entity_types`.
    ///
    /// Types with a stored position resume from it; the rest start strictly
    /// after `since`.
    pub async fn read(
        &self,
        organization_id: &str,
        entity_types: &[EntityType],
        since: DateTime<Utc>,
        positions: &BTreeMap<String, ChangePosition>,
    ) -> Result<ChangePage> {
        let mut page = ChangePage::default();

        for &entity_type in entity_types {
            let start = positions
                .get(entity_type.as_str())
                .cloned()
                .unwrap_or_else(|| ChangePosition::after(since));

            // One extra row tells us whether the type was truncated
            let mut rows = self
                .store
                .changed_since(entity_type, organization_id, &start, self.page_size + 1)
                .await?;

            if rows.len() > self.page_size as usize {
                rows.truncate(self.page_size as usize);
                page.has_more = true;
            }

            let position = rows.last().map(ChangePosition::past).unwrap_or(start);
            page.positions
                .insert(entity_type.as_str().to_string(), position);

            let records = page
                .changes
                .entry(entity_type.collection().to_string())
                .or_default();

            for entity in rows {
                if let Some(deleted_at) = entity.deleted_at {
                    page.deletions.push(Tombstone {
                        entity_type,
                        entity_id: entity.id.clone(),
                        version: entity.version,
                        deleted_at,
                    });
                }
                records.push(change_record(entity_type, &entity));
            }
        }

        tracing::debug!(
            "Read {} changes and {} deletions for {} (has_more: {})",
            page.changes.values().map(Vec::len).sum::<usize>(),
            page.deletions.len(),
            organization_id,
            page.has_more
        );

        Ok(page)
    }
}

/// Server-originated change record for a stored entity
pub fn change_record(entity_type: EntityType, entity: &SyncedEntity) -> ChangeRecord {
    let operation = if entity.is_deleted() {
        ChangeOperation::Delete
    } else {
        ChangeOperation::Update
    };

    ChangeRecord {
        entity_type: entity_type.as_str().to_string(),
        entity_id: Some(entity.id.clone()),
        operation,
        data: Some(entity.to_json()),
        version: Some(entity.version),
        client_id: entity.client_id.clone(),
        timestamp: Some(entity.updated_at),
    }
}
