//! Inbound and outbound message shapes shared by every transport.
//!
//! The broadcast channel and the durable change stream carry the same
//! `SyncMessage` JSON. Transports hand the engine raw `serde_json::Value`
//! payloads; decoding happens here so a malformed message is dropped in one
//! place and never reaches the object map.

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{ObjectId, PersistedRecord, Point};

// =============================================================================
// OBJECT MESSAGES
// =============================================================================

/// One object change, as broadcast between peers and replayed by the change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncMessage {
    Create { object: PersistedRecord },
    Update { object: PersistedRecord },
    Delete { id: ObjectId },
}

impl SyncMessage {
    /// Decode an inbound payload. Returns `None` for anything malformed.
    #[must_use]
    pub fn decode(payload: serde_json::Value) -> Option<Self> {
        match serde_json::from_value(payload) {
            Ok(msg) => Some(msg),
            Err(e) => {
                debug!(error = %e, "dropping malformed sync message");
                None
            }
        }
    }

    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Id of the object this message concerns.
    #[must_use]
    pub fn object_id(&self) -> &str {
        match self {
            Self::Create { object } | Self::Update { object } => &object.id,
            Self::Delete { id } => id,
        }
    }
}

// =============================================================================
// PRESENCE MESSAGES
// =============================================================================

/// What a participant publishes about itself when tracked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub participant_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub cursor: Option<Point>,
}

/// Fast-path cursor update. `cursor: None` means "not hovering".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub sender_id: String,
    pub cursor: Option<Point>,
}

impl CursorPayload {
    /// Decode a presence broadcast. Returns `None` for anything malformed.
    #[must_use]
    pub fn decode(payload: serde_json::Value) -> Option<Self> {
        match serde_json::from_value(payload) {
            Ok(msg) => Some(msg),
            Err(e) => {
                debug!(error = %e, "dropping malformed cursor payload");
                None
            }
        }
    }
}

/// Events delivered on a presence subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Full roster snapshot. Replaces, never amends, the local roster.
    Sync(Vec<PresenceMeta>),
    /// Raw presence broadcast from a peer, normally a `CursorPayload`.
    Broadcast(serde_json::Value),
}
