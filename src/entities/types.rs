//! Synced entity types
//!
//! Every domain record that participates in sync carries the same columns:
//! id, organization, version, timestamps and a soft-delete marker. Domain
//! fields are kept as a free-form JSON object.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Keys owned by the sync layer; clients can never write them directly
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "version",
    "createdAt",
    "updatedAt",
    "deletedAt",
    "organizationId",
    "userId",
    "clientId",
];

/// Types of entities that can be synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Reservation,
    Order,
    Customer,
    MenuItem,
    Notification,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Reservation,
        EntityType::Order,
        EntityType::Customer,
        EntityType::MenuItem,
        EntityType::Notification,
    ];

    /// Wire name used in change records
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Reservation => "reservation",
            EntityType::Order => "order",
            EntityType::Customer => "customer",
            EntityType::MenuItem => "menuItem",
            EntityType::Notification => "notification",
        }
    }

    /// Backing table name
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Reservation => "reservations",
            EntityType::Order => "orders",
            EntityType::Customer => "customers",
            EntityType::MenuItem => "menu_items",
            EntityType::Notification => "notifications",
        }
    }

    /// Key of this type's change list in a pull response
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Reservation => "reservations",
            EntityType::Order => "orders",
            EntityType::Customer => "customers",
            EntityType::MenuItem => "menu",
            EntityType::Notification => "notifications",
        }
    }

    /// Whether devices may create, update or delete this type.
    /// Menu items and notifications are server-authored and pull-only.
    pub fn accepts_client_writes(&self) -> bool {
        matches!(
            self,
            EntityType::Reservation | EntityType::Order | EntityType::Customer
        )
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = StoreError;

    /// Accepts both the singular wire name and the pull collection name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.collection() == s)
            .ok_or_else(|| StoreError::UnknownEntityType(s.to_string()))
    }
}

/// A stored entity together with its sync metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedEntity {
    pub id: String,
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Optimistic concurrency token, starts at 1
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Domain fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl SyncedEntity {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Full JSON view sent to clients as `data` / `serverData`
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Input for inserting a new entity
#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    /// Client-chosen id; a UUID is generated when absent
    pub id: Option<String>,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub fields: Map<String, Value>,
}

/// Exclusive lower bound of a change-log read, ordered by `(updated_at, id)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePosition {
    pub updated_at: DateTime<Utc>,
    /// Last id already delivered at `updated_at`; `None` means strictly after
    /// `updated_at`
    #[serde(default)]
    pub id: Option<String>,
}

impl ChangePosition {
    pub fn after(updated_at: DateTime<Utc>) -> Self {
        Self { updated_at, id: None }
    }

    /// Position just past the given entity
    pub fn past(entity: &SyncedEntity) -> Self {
        Self {
            updated_at: entity.updated_at,
            id: Some(entity.id.clone()),
        }
    }
}

/// Extract writable domain fields from a client payload
pub fn sanitize_fields(data: Option<&Value>) -> Result<Map<String, Value>, StoreError> {
    match data {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map
            .iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()),
        Some(other) => Err(StoreError::InvalidPayload(format!(
            "entity data must be an object, got {}",
            json_kind(other)
        ))),
    }
}

/// Shallow merge, preferring `overlay` for keys present in both
pub fn merge_fields(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
