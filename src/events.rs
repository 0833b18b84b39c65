//! Real-time change notifications
//!
//! Mutations are published on an in-process broadcast channel so that a
//! transport (WebSocket, SSE, push gateway) can fan them out to the other
//! devices of an organization. Publishing never blocks and never fails the
//! originating request.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::entities::{EntityType, SyncedEntity};

/// Default channel capacity; slow subscribers lag instead of blocking writers
const CHANNEL_CAPACITY: usize = 256;

/// Who should not receive an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Exclude {
    Device(String),
    User(String),
}

/// A change notification for one organization
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub organization_id: String,
    pub event: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Exclude>,
}

/// What happened to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    fn suffix(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Event name such as `reservation_updated`
pub fn event_name(entity_type: EntityType, kind: ChangeKind) -> String {
    format!("{}_{}", entity_type.as_str(), kind.suffix())
}

/// Fire-and-forget broadcast bus
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: ChangeEvent) {
        let name = event.event.clone();
        if self.sender.send(event).is_err() {
            tracing::trace!("No subscribers for {}", name);
        }
    }

    /// Publish an entity mutation to its organization
    pub fn entity_changed(
        &self,
        entity_type: EntityType,
        kind: ChangeKind,
        entity: &SyncedEntity,
        actor: Value,
        exclude: Option<Exclude>,
    ) {
        self.publish(ChangeEvent {
            organization_id: entity.organization_id.clone(),
            event: event_name(entity_type, kind),
            payload: serde_json::json!({
                "entityType": entity_type,
                "entityId": entity.id,
                "version": entity.version,
                "entity": entity.to_json(),
                "changedBy": actor,
            }),
            exclude,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
