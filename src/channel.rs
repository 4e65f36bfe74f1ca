//! Channel manager: one board's object map and its sync traffic.
//!
//! DESIGN
//! ======
//! Local mutations are optimistic. Each one applies to the store (which
//! publishes a render snapshot), fans out on the broadcast channel, and then
//! queues a durable write. Writes drain through a single background writer so
//! a create, update, and delete of the same object reach storage in the order
//! they were made, and the caller never waits on storage I/O.
//!
//! Inbound traffic arrives from two sources carrying the same message shape:
//! peer broadcasts and the durable change stream. Both go through the same
//! handler. Creates and updates merge last-write-wins; deletes are absolute.
//!
//! ERROR HANDLING
//! ==============
//! Persistence failures are logged and never roll back local state. Malformed
//! inbound payloads and unconvertible records are dropped with a debug log.

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::message::SyncMessage;
use crate::model::{
    CanvasObject, MergeOutcome, ObjectPatch, PersistedRecord, object_to_record, record_to_object,
};
use crate::store::{ObjectStore, Snapshot};
use crate::transport::{Inbound, PersistOp, Transport, TransportError};

const PERSIST_QUEUE_CAPACITY: usize = 1024;

/// The mutation surface the undo grouper drives.
pub trait ObjectMutator {
    fn get(&self, id: &str) -> Option<&CanvasObject>;

    /// Insert `object` as a new local write. Returns it as stored.
    fn create(&mut self, object: CanvasObject) -> CanvasObject;

    /// Apply `patch` to `id`. Returns the updated object, or `None` if absent.
    fn update(&mut self, id: &str, patch: &ObjectPatch) -> Option<CanvasObject>;

    /// Remove `id`. Returns the removed object, if it was present.
    fn delete(&mut self, id: &str) -> Option<CanvasObject>;
}

// =============================================================================
// FEEDS
// =============================================================================

/// Both inbound sources for one board. Dropping this unsubscribes.
pub struct BoardFeeds {
    broadcast: Inbound,
    changes: Inbound,
}

impl BoardFeeds {
    /// Next payload from either source, or `None` once both have closed.
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        tokio::select! {
            Some(v) = self.broadcast.recv() => Some(v),
            Some(v) = self.changes.recv() => Some(v),
            else => None,
        }
    }
}

// =============================================================================
// PERSIST WRITER
// =============================================================================

enum PersistJob {
    Write(PersistOp),
    Barrier(oneshot::Sender<()>),
}

fn spawn_writer(transport: Arc<dyn Transport>, board_id: String) -> mpsc::Sender<PersistJob> {
    let (tx, mut rx) = mpsc::channel::<PersistJob>(PERSIST_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                PersistJob::Write(op) => {
                    let label = op.label();
                    let object_id = op.object_id().to_owned();
                    if let Err(e) = transport.persist(&board_id, op).await {
                        warn!(board_id = %board_id, op = label, object_id = %object_id, error = %e, "persist failed");
                    }
                }
                PersistJob::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
    });
    tx
}

// =============================================================================
// MANAGER
// =============================================================================

pub struct ChannelManager {
    board_id: String,
    creator_id: Option<String>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    store: ObjectStore,
    persist_tx: mpsc::Sender<PersistJob>,
}

impl ChannelManager {
    /// Must be called inside a tokio runtime; spawns the persist writer.
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        board_id: impl Into<String>,
        creator_id: Option<String>,
    ) -> Self {
        let board_id = board_id.into();
        let persist_tx = spawn_writer(Arc::clone(&transport), board_id.clone());
        Self { board_id, creator_id, transport, clock, store: ObjectStore::new(), persist_tx }
    }

    #[must_use]
    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    #[must_use]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    #[must_use]
    pub fn subscribe_render(&self) -> watch::Receiver<Snapshot> {
        self.store.subscribe()
    }

    /// Open both inbound sources.
    #[must_use]
    pub fn subscribe(&self) -> BoardFeeds {
        BoardFeeds {
            broadcast: self.transport.subscribe_broadcast(&self.board_id),
            changes: self.transport.subscribe_change_stream(&self.board_id),
        }
    }

    // =========================================================================
    // LOAD
    // =========================================================================

    /// Fetch the board and replace the local map wholesale.
    pub async fn load(&mut self) -> Result<usize, TransportError> {
        let records = self.transport.fetch_all(&self.board_id).await?;
        Ok(self.apply_snapshot(records))
    }

    /// Replace the local map with `records`. Returns how many were kept.
    pub fn apply_snapshot(&mut self, records: Vec<PersistedRecord>) -> usize {
        let total = records.len();
        let objects: Vec<CanvasObject> = records
            .iter()
            .filter_map(|record| match record_to_object(record) {
                Ok(obj) => Some(obj),
                Err(e) => {
                    debug!(board_id = %self.board_id, error = %e, "skipping unreadable record");
                    None
                }
            })
            .collect();
        let kept = objects.len();
        self.store.replace_all(objects);
        info!(board_id = %self.board_id, kept, skipped = total - kept, "board loaded");
        kept
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.persist_tx.send(PersistJob::Barrier(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    // =========================================================================
    // LOCAL MUTATIONS
    // =========================================================================

    /// Stamp, insert, broadcast, and queue a durable create.
    pub fn create(&mut self, mut object: CanvasObject) -> CanvasObject {
        object.last_modified = self.clock.now();
        self.store.upsert(object.clone());
        let record = self.record(&object);
        self.transport
            .send_broadcast(&self.board_id, &SyncMessage::Create { object: record.clone() });
        self.queue(PersistOp::Create(record));
        object
    }

    /// Merge `patch` over `id` and re-stamp. No-op when `id` is absent.
    pub fn update(&mut self, id: &str, patch: &ObjectPatch) -> Option<CanvasObject> {
        let now = self.clock.now();
        let updated = self.store.modify(id, |obj| {
            patch.apply_to(obj);
            obj.last_modified = now;
            obj.clone()
        })?;
        let record = self.record(&updated);
        self.transport
            .send_broadcast(&self.board_id, &SyncMessage::Update { object: record.clone() });
        self.queue(PersistOp::Update(record));
        Some(updated)
    }

    /// Remove `id` unconditionally; the delete fans out even if we never had it.
    pub fn delete(&mut self, id: &str) -> Option<CanvasObject> {
        let removed = self.store.remove(id);
        self.transport
            .send_broadcast(&self.board_id, &SyncMessage::Delete { id: id.to_owned() });
        self.queue(PersistOp::Delete { id: id.to_owned() });
        removed
    }

    fn record(&self, object: &CanvasObject) -> PersistedRecord {
        object_to_record(object, &self.board_id, self.creator_id.as_deref())
    }

    fn queue(&self, op: PersistOp) {
        if let Err(e) = self.persist_tx.try_send(PersistJob::Write(op)) {
            warn!(board_id = %self.board_id, error = %e, "persist queue full, dropping write");
        }
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Decode and apply a payload from either inbound source.
    pub fn handle_inbound(&mut self, payload: serde_json::Value) -> MergeOutcome {
        match SyncMessage::decode(payload) {
            Some(msg) => self.apply_message(msg),
            None => MergeOutcome::Unchanged,
        }
    }

    pub fn apply_message(&mut self, msg: SyncMessage) -> MergeOutcome {
        match msg {
            SyncMessage::Create { object } | SyncMessage::Update { object } => {
                if object.board_id != self.board_id {
                    debug!(board_id = %self.board_id, other = %object.board_id, "ignoring record for another board");
                    return MergeOutcome::Unchanged;
                }
                match record_to_object(&object) {
                    Ok(obj) => self.store.merge(obj),
                    Err(e) => {
                        debug!(board_id = %self.board_id, error = %e, "dropping unreadable record");
                        MergeOutcome::Unchanged
                    }
                }
            }
            SyncMessage::Delete { id } => {
                if self.store.remove(&id).is_some() {
                    MergeOutcome::Changed
                } else {
                    MergeOutcome::Unchanged
                }
            }
        }
    }
}

impl ObjectMutator for ChannelManager {
    fn get(&self, id: &str) -> Option<&CanvasObject> {
        self.store.get(id)
    }

    fn create(&mut self, object: CanvasObject) -> CanvasObject {
        ChannelManager::create(self, object)
    }

    fn update(&mut self, id: &str, patch: &ObjectPatch) -> Option<CanvasObject> {
        ChannelManager::update(self, id, patch)
    }

    fn delete(&mut self, id: &str) -> Option<CanvasObject> {
        ChannelManager::delete(self, id)
    }
}
