use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// The four entity kinds this engine reconciles. New kinds are expected to
/// be rare enough that a fixed enum (rather than a registry) is the right
/// shape, the same way `sync15-adapter`'s collection names were a fixed,
/// small set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Event,
    EventType,
    Geofence,
    PropertyDefinition,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Event => "event",
            EntityKind::EventType => "event_type",
            EntityKind::Geofence => "geofence",
            EntityKind::PropertyDefinition => "property_definition",
        }
    }

    pub fn collection_path(&self) -> &'static str {
        match self {
            EntityKind::Event => "events",
            EntityKind::EventType => "event_types",
            EntityKind::Geofence => "geofences",
            EntityKind::PropertyDefinition => "property_definitions",
        }
    }

    /// Bootstrap must delete/insert in dependency order: `Event` and
    /// `Geofence` and `PropertyDefinition` all reference `EventType`.
    pub const DELETE_ORDER: [EntityKind; 4] = [
        EntityKind::Event,
        EntityKind::Geofence,
        EntityKind::PropertyDefinition,
        EntityKind::EventType,
    ];

    pub const FETCH_ORDER: [EntityKind; 4] = [
        EntityKind::EventType,
        EntityKind::Geofence,
        EntityKind::Event,
        EntityKind::PropertyDefinition,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// One row in the server's append-only change log. `id` is the monotonic
/// cursor position; clients persist the highest `id` they've consumed as
/// their `cursor` and never accept one going backward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    #[serde(rename = "entity_type")]
    pub entity_kind: EntityKind,
    pub operation: Operation,
    pub entity_id: EntityId,
    pub data: Option<serde_json::Value>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A cached response for a previously-seen `(key, route, user_id)` triple,
/// keyed by the client's idempotency key (== its mutation's
/// `client_request_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub route: String,
    pub user_id: String,
    pub response_body: serde_json::Value,
    pub status_code: u16,
    pub created_at: DateTime<Utc>,
}
