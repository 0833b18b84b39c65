//! Offline-first sync
//!
//! Devices keep a local replica and reconcile with the server through:
//! - pull: changes since the device's cursor, paginated by `(updated_at, id)`
//! - push: client mutations applied record by record with version checks
//! - conflict resolution: SERVER_WINS, CLIENT_WINS, MERGE or MANUAL
//!
//! Concurrency control is optimistic: every entity carries a version that
//! grows by one per accepted mutation, and every write is a conditional
//! update against the version the writer saw.

pub mod applier;
pub mod change_log;
pub mod conflict;
pub mod engine;
pub mod housekeeping;
pub mod locks;
pub mod oplog;
pub mod session;
pub mod types;
pub mod versioning;

pub use engine::{HousekeepingReport, PushResult, SyncEngine};
pub use session::{generate_sync_token, SessionRepository};
pub use types::*;
pub use versioning::{FieldWrite, VersionGuard};
