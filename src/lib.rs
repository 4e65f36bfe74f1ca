//! Boardsync: real-time object synchronization and presence for shared canvases.
//!
//! ARCHITECTURE
//! ============
//! Leaves first:
//! - `model`: canvas objects, persisted records, conversion, LWW merge.
//! - `throttle`: trailing-edge rate limiter used by presence.
//! - `store`: the authoritative per-board object map (arena + index).
//! - `channel`: optimistic local mutations, fan-out, inbound merge.
//! - `presence`: roster, cursor fast path, deterministic colors.
//! - `connection`: UI-facing connection indicator state machine.
//! - `undo`: grouped reversible mutation history.
//! - `session`: one task per board view that owns all of the above.
//!
//! DATA FLOW
//! =========
//! A mutation applies to the local store first, publishes a new snapshot,
//! fans out on the best-effort broadcast channel, and persists in the
//! background. Peers merge broadcasts and durable change-stream events with
//! last-write-wins on `last_modified`. Presence travels on its own channel
//! and is never persisted.

pub mod channel;
pub mod clock;
pub mod config;
pub mod connection;
pub mod frame;
pub mod message;
pub mod model;
pub mod presence;
pub mod session;
pub mod store;
pub mod throttle;
pub mod transport;
pub mod undo;

pub use channel::{BoardFeeds, ChannelManager, ObjectMutator};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::SyncConfig;
pub use connection::{ConnectionMonitor, ConnectionStatus, Indicator};
pub use message::{PresenceEvent, PresenceMeta, SyncMessage};
pub use model::{CanvasObject, MergeOutcome, ObjectPatch, PersistedRecord, Point, ShapeKind};
pub use presence::{PresenceEntry, PresenceTracker, Roster, cursor_color};
pub use session::{BoardSession, MutationIntent, Participant, SessionClosed, SessionHandle};
pub use store::{ObjectStore, Snapshot};
pub use throttle::{Throttle, Throttled};
pub use transport::memory::{MemoryHub, MemoryTransport};
pub use transport::ws::WsTransport;
pub use transport::{PersistOp, Transport, TransportError};
pub use undo::{FieldChange, GroupRecorder, UndoEntry, UndoGroup, UndoHistory};
