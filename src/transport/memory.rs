//! In-process transport: a shared hub standing in for relay + storage.
//!
//! DESIGN
//! ======
//! `MemoryHub` owns per-board durable records, subscriber lists, and the
//! presence roster behind one `std::sync::Mutex`. Each `MemoryTransport` is
//! one client connection with its own link status. Sends use `try_send`, so a
//! full subscriber queue drops the message exactly as a lossy network would.
//!
//! While a connection's link is not `Connected` it neither sends nor receives
//! broadcasts, and its presence is removed from every roster. That reproduces
//! the missed-message window a reconnect resync has to repair.
//!
//! Storage writes are last-write-wins guarded, and only applied writes reach
//! the change stream.

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{Inbound, PersistOp, PresenceInbound, Transport, TransportError};
use crate::connection::ConnectionStatus;
use crate::message::{PresenceEvent, PresenceMeta, SyncMessage};
use crate::model::{ObjectId, PersistedRecord};

type ConnId = u64;

// =============================================================================
// HUB
// =============================================================================

/// Shared backend. Clone to hand the same hub to many connections.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
    next_conn: Arc<AtomicU64>,
    capacity: usize,
}

#[derive(Default)]
struct HubInner {
    boards: HashMap<String, BoardRoom>,
}

#[derive(Default)]
struct BoardRoom {
    records: HashMap<ObjectId, PersistedRecord>,
    broadcast: Vec<Subscriber<serde_json::Value>>,
    changes: Vec<Subscriber<serde_json::Value>>,
    presence: Vec<Subscriber<PresenceEvent>>,
    roster: BTreeMap<ConnId, PresenceMeta>,
}

struct Subscriber<T> {
    conn: ConnId,
    link: Arc<Link>,
    tx: mpsc::Sender<T>,
}

impl<T> Subscriber<T> {
    /// Best-effort delivery; a closed, full, or offline subscriber misses it.
    fn deliver(&self, value: T) {
        if !self.link.is_connected() {
            return;
        }
        if self.tx.try_send(value).is_err() {
            debug!(conn = self.conn, "memory hub: subscriber dropped message");
        }
    }
}

/// Per-connection link state and fault switches.
struct Link {
    status_tx: watch::Sender<ConnectionStatus>,
    fail_persist: AtomicBool,
}

impl Link {
    fn is_connected(&self) -> bool {
        *self.status_tx.borrow() == ConnectionStatus::Connected
    }
}

impl MemoryHub {
    /// A hub whose subscriptions buffer at most `capacity` messages each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner::default())),
            next_conn: Arc::new(AtomicU64::new(1)),
            capacity: capacity.max(1),
        }
    }

    /// Open a new client connection, initially `Connected`.
    #[must_use]
    pub fn connect(&self) -> MemoryTransport {
        let (status_tx, _) = watch::channel(ConnectionStatus::Connected);
        MemoryTransport {
            hub: self.clone(),
            conn: self.next_conn.fetch_add(1, Ordering::Relaxed),
            link: Arc::new(Link { status_tx, fail_persist: AtomicBool::new(false) }),
        }
    }

    /// Durable records for a board, ordered by stack order.
    #[must_use]
    pub fn records(&self, board_id: &str) -> Vec<PersistedRecord> {
        let inner = self.lock();
        let Some(room) = inner.boards.get(board_id) else {
            return Vec::new();
        };
        let mut records: Vec<PersistedRecord> = room.records.values().cloned().collect();
        records.sort_by(|a, b| a.stack_order.cmp(&b.stack_order).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Write straight to storage without notifying anyone, as if the change
    /// stream event were lost.
    pub fn seed(&self, record: PersistedRecord) {
        let mut inner = self.lock();
        let room = inner.boards.entry(record.board_id.clone()).or_default();
        room.records.insert(record.id.clone(), record);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(crate::config::SyncConfig::default().inbound_capacity)
    }
}

impl BoardRoom {
    fn prune(&mut self) {
        self.broadcast.retain(|s| !s.tx.is_closed());
        self.changes.retain(|s| !s.tx.is_closed());
        self.presence.retain(|s| !s.tx.is_closed());
    }

    fn sync_roster(&self) {
        let roster: Vec<PresenceMeta> = self.roster.values().cloned().collect();
        for sub in &self.presence {
            sub.deliver(PresenceEvent::Sync(roster.clone()));
        }
    }

    /// Apply a write with LWW guarding. Returns true if storage changed.
    fn apply(&mut self, op: &PersistOp) -> bool {
        match op {
            PersistOp::Create(record) | PersistOp::Update(record) => {
                let newer = self
                    .records
                    .get(&record.id)
                    .is_none_or(|existing| record.last_modified > existing.last_modified);
                if newer {
                    self.records.insert(record.id.clone(), record.clone());
                }
                newer
            }
            PersistOp::Delete { id } => self.records.remove(id).is_some(),
        }
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// One client's connection to a `MemoryHub`.
pub struct MemoryTransport {
    hub: MemoryHub,
    conn: ConnId,
    link: Arc<Link>,
}

impl MemoryTransport {
    /// Simulate the link changing state. Leaving `Connected` drops this
    /// connection's presence from every roster.
    pub fn set_status(&self, status: ConnectionStatus) {
        self.link.status_tx.send_replace(status);
        if status != ConnectionStatus::Connected {
            self.drop_presence();
        }
    }

    /// Make every subsequent `persist` fail until switched back.
    pub fn set_fail_persist(&self, fail: bool) {
        self.link.fail_persist.store(fail, Ordering::Relaxed);
    }

    fn subscriber<T>(&self, tx: mpsc::Sender<T>) -> Subscriber<T> {
        Subscriber { conn: self.conn, link: Arc::clone(&self.link), tx }
    }

    fn drop_presence(&self) {
        let mut inner = self.hub.lock();
        for room in inner.boards.values_mut() {
            if room.roster.remove(&self.conn).is_some() {
                room.prune();
                room.sync_roster();
            }
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.drop_presence();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch_all(&self, board_id: &str) -> Result<Vec<PersistedRecord>, TransportError> {
        if !self.link.is_connected() {
            return Err(TransportError::Closed);
        }
        Ok(self.hub.records(board_id))
    }

    async fn persist(&self, board_id: &str, op: PersistOp) -> Result<(), TransportError> {
        if self.link.fail_persist.load(Ordering::Relaxed) {
            return Err(TransportError::Persistence("injected failure".into()));
        }
        if !self.link.is_connected() {
            return Err(TransportError::Closed);
        }
        let mut inner = self.hub.lock();
        let room = inner.boards.entry(board_id.to_owned()).or_default();
        if room.apply(&op) {
            room.prune();
            let payload = op.to_message().to_value();
            for sub in &room.changes {
                sub.deliver(payload.clone());
            }
        }
        Ok(())
    }

    fn subscribe_broadcast(&self, board_id: &str) -> Inbound {
        let (tx, rx) = mpsc::channel(self.hub.capacity);
        let mut inner = self.hub.lock();
        let room = inner.boards.entry(board_id.to_owned()).or_default();
        room.broadcast.push(self.subscriber(tx));
        rx
    }

    fn subscribe_change_stream(&self, board_id: &str) -> Inbound {
        let (tx, rx) = mpsc::channel(self.hub.capacity);
        let mut inner = self.hub.lock();
        let room = inner.boards.entry(board_id.to_owned()).or_default();
        room.changes.push(self.subscriber(tx));
        rx
    }

    fn send_broadcast(&self, board_id: &str, message: &SyncMessage) {
        if !self.link.is_connected() {
            return;
        }
        let mut inner = self.hub.lock();
        let Some(room) = inner.boards.get_mut(board_id) else {
            return;
        };
        room.prune();
        let payload = message.to_value();
        for sub in room.broadcast.iter().filter(|s| s.conn != self.conn) {
            sub.deliver(payload.clone());
        }
    }

    fn subscribe_presence(&self, board_id: &str) -> PresenceInbound {
        let (tx, rx) = mpsc::channel(self.hub.capacity);
        let mut inner = self.hub.lock();
        let room = inner.boards.entry(board_id.to_owned()).or_default();
        room.presence.push(self.subscriber(tx));
        rx
    }

    fn send_presence_broadcast(&self, board_id: &str, payload: serde_json::Value) {
        if !self.link.is_connected() {
            return;
        }
        let mut inner = self.hub.lock();
        let Some(room) = inner.boards.get_mut(board_id) else {
            return;
        };
        room.prune();
        for sub in room.presence.iter().filter(|s| s.conn != self.conn) {
            sub.deliver(PresenceEvent::Broadcast(payload.clone()));
        }
    }

    async fn track(&self, board_id: &str, meta: PresenceMeta) -> Result<(), TransportError> {
        if !self.link.is_connected() {
            return Err(TransportError::Closed);
        }
        let mut inner = self.hub.lock();
        let room = inner.boards.entry(board_id.to_owned()).or_default();
        room.roster.insert(self.conn, meta);
        room.prune();
        room.sync_roster();
        Ok(())
    }

    async fn untrack(&self, board_id: &str) -> Result<(), TransportError> {
        let mut inner = self.hub.lock();
        if let Some(room) = inner.boards.get_mut(board_id) {
            if room.roster.remove(&self.conn).is_some() {
                room.prune();
                room.sync_roster();
            }
        }
        Ok(())
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.link.status_tx.subscribe()
    }
}
