//! Synced entities
//!
//! Domain records (reservations, orders, customers, menu items and
//! notifications) share one sync contract:
//!
//! - `version` starts at 1 and grows by exactly one per accepted mutation
//! - `updated_at` moves with every mutation
//! - deletion is a soft delete through `deleted_at`, so it can be pulled
//!
//! Menu items and notifications are authored on the server and only flow
//! down to devices.

mod store;
mod types;

pub use store::{EntityStore, SqliteEntityStore};
pub use types::{
    merge_fields, sanitize_fields, ChangePosition, EntityType, NewEntity, SyncedEntity,
    RESERVED_FIELDS,
};
