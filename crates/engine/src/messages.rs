//! Change notification types and decoder.
//!
//! The backend publishes one JSON object per row change with the shape
//! `{"table": "jobs", "operation": "UPDATE", "id": "...", "workflow_id":
//! "...", "new_status": "...", "timestamp": 1712345678.123}`. This module
//! deserializes it into a strongly-typed [`ChangeNotification`].

use flowsync_core::types::{EntityId, Timestamp};
use flowsync_core::wire::{OP_DELETE, OP_INSERT, OP_UPDATE, TABLE_JOBS, TABLE_WORKFLOWS};
use serde::Deserialize;

/// The kind of entity a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "workflows", alias = "workflow")]
    Workflow,
    #[serde(rename = "jobs", alias = "job")]
    Job,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => TABLE_WORKFLOWS,
            Self::Job => TABLE_JOBS,
        }
    }
}

/// The row operation that produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => OP_INSERT,
            Self::Update => OP_UPDATE,
            Self::Delete => OP_DELETE,
        }
    }

    /// Inserts and deletes change the size of a collection, so every
    /// listing view has to reflect them.
    pub fn changes_cardinality(&self) -> bool {
        matches!(self, Self::Insert | Self::Delete)
    }
}

/// A decoded change notification.
///
/// Immutable once received and discarded after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub entity_kind: EntityKind,
    pub operation: Operation,
    pub entity_id: EntityId,
    /// Owning workflow for job notifications.
    pub parent_id: Option<EntityId>,
    /// Present when the change touched the row's status column.
    pub new_status: Option<String>,
    /// When the backend emitted the notification, if it said so.
    pub emitted_at: Option<Timestamp>,
}

impl ChangeNotification {
    /// Whether the change carries a status transition.
    pub fn has_status_change(&self) -> bool {
        self.new_status.is_some()
    }
}

/// Raw payload as written by the backend trigger.
#[derive(Debug, Deserialize)]
struct WireChange {
    #[serde(rename = "table", alias = "entityKind", alias = "entity_kind")]
    table: EntityKind,
    operation: Operation,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    new_status: Option<String>,
    #[serde(default)]
    timestamp: Option<f64>,
}

/// Errors produced while decoding a notification payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not JSON, or does not match the notification schema.
    #[error("Malformed change notification: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A required field is absent or empty.
    #[error("Change notification is missing required field `{0}`")]
    MissingField(&'static str),
}

/// Decode a raw stream payload into a [`ChangeNotification`].
///
/// Returns `Err` for malformed JSON, unknown tables or operations, and
/// missing ids. Callers should log the error and drop the message.
pub fn decode(raw: &str) -> Result<ChangeNotification, DecodeError> {
    let wire: WireChange = serde_json::from_str(raw)?;

    let entity_id = non_empty(wire.id).ok_or(DecodeError::MissingField("id"))?;

    Ok(ChangeNotification {
        entity_kind: wire.table,
        operation: wire.operation,
        entity_id,
        parent_id: non_empty(wire.workflow_id),
        new_status: non_empty(wire.new_status),
        emitted_at: wire
            .timestamp
            .and_then(|secs| chrono::DateTime::from_timestamp_millis((secs * 1000.0) as i64)),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
