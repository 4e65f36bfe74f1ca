//! Transport and storage collaborator consumed by the engine.
//!
//! ARCHITECTURE
//! ============
//! Any backend (an in-process hub, a WebSocket relay, a managed realtime
//! database) plugs in by implementing `Transport`. Inbound traffic is exposed
//! as bounded channels rather than callbacks: the engine owns the receivers,
//! and dropping them is the synchronous unsubscribe.
//!
//! Delivery is at-most-once. A full inbound queue drops the newest message,
//! and nothing is ordered across the broadcast and change-stream sources.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::connection::ConnectionStatus;
use crate::message::{PresenceEvent, PresenceMeta, SyncMessage};
use crate::model::{ObjectId, PersistedRecord};

/// Raw inbound payloads from the broadcast channel or the change stream.
pub type Inbound = mpsc::Receiver<serde_json::Value>;

/// Presence roster syncs and presence broadcasts for one board.
pub type PresenceInbound = mpsc::Receiver<PresenceEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("rejected by backend: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A durable write.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    Create(PersistedRecord),
    Update(PersistedRecord),
    Delete { id: ObjectId },
}

impl PersistOp {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::Delete { .. } => "delete",
        }
    }

    #[must_use]
    pub fn object_id(&self) -> &str {
        match self {
            Self::Create(record) | Self::Update(record) => &record.id,
            Self::Delete { id } => id,
        }
    }

    /// The change-stream message a successful write produces.
    #[must_use]
    pub fn to_message(&self) -> SyncMessage {
        match self {
            Self::Create(record) => SyncMessage::Create { object: record.clone() },
            Self::Update(record) => SyncMessage::Update { object: record.clone() },
            Self::Delete { id } => SyncMessage::Delete { id: id.clone() },
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Full snapshot of a board, ordered by stack order.
    async fn fetch_all(&self, board_id: &str) -> Result<Vec<PersistedRecord>, TransportError>;

    /// Best-effort durable write.
    async fn persist(&self, board_id: &str, op: PersistOp) -> Result<(), TransportError>;

    /// Peer broadcasts for `board_id`. Never includes our own sends.
    fn subscribe_broadcast(&self, board_id: &str) -> Inbound;

    /// Committed storage changes for `board_id`, including our own writes.
    fn subscribe_change_stream(&self, board_id: &str) -> Inbound;

    /// Fire-and-forget fan-out to peers. No delivery confirmation.
    fn send_broadcast(&self, board_id: &str, message: &SyncMessage);

    fn subscribe_presence(&self, board_id: &str) -> PresenceInbound;

    /// Fire-and-forget presence fan-out to peers (cursor moves).
    fn send_presence_broadcast(&self, board_id: &str, payload: serde_json::Value);

    /// Publish our presence on `board_id`. Replaces any earlier meta.
    async fn track(&self, board_id: &str, meta: PresenceMeta) -> Result<(), TransportError>;

    async fn untrack(&self, board_id: &str) -> Result<(), TransportError>;

    /// Connection status as reported by the underlying link.
    fn status(&self) -> watch::Receiver<ConnectionStatus>;
}
