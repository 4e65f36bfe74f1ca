//! Authoritative per-board object map.
//!
//! DESIGN
//! ======
//! Objects live in an arena of slots with an `id -> slot` index. Freed slots
//! are reused. Each entry remembers the sequence number of its insertion so
//! equal `stack_order` values draw in the order they arrived.
//!
//! Readers never see the arena. They get an immutable, stack-order-sorted
//! `Snapshot`, and every mutation publishes a fresh one on a `watch` channel
//! for the render consumer. There is exactly one store per board view; the
//! map is never shared across tasks.

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::model::{CanvasObject, MergeOutcome, ObjectId, ShapeKind, should_replace};

/// Immutable, back-to-front ordered view of a board.
pub type Snapshot = Arc<Vec<CanvasObject>>;

struct Entry {
    object: CanvasObject,
    seq: u64,
}

pub struct ObjectStore {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    index: HashMap<ObjectId, usize>,
    next_seq: u64,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl ObjectStore {
    #[must_use]
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self { slots: Vec::new(), free: Vec::new(), index: HashMap::new(), next_seq: 0, snapshot_tx }
    }

    // =========================================================================
    // READS
    // =========================================================================

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&CanvasObject> {
        let slot = *self.index.get(id)?;
        self.slots[slot].as_ref().map(|e| &e.object)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Stack order for a newly created object: one above the current top, or 0.
    #[must_use]
    pub fn next_stack_order(&self) -> i64 {
        self.entries()
            .map(|e| e.object.stack_order)
            .max()
            .map_or(0, |top| top.saturating_add(1))
    }

    /// All objects sorted by `(stack_order, insertion order)`.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mut entries: Vec<&Entry> = self.entries().collect();
        entries.sort_by_key(|e| (e.object.stack_order, e.seq));
        Arc::new(entries.into_iter().map(|e| e.object.clone()).collect())
    }

    /// Subscribe to snapshots published after every mutation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Resolve a connector's endpoints against the current map.
    ///
    /// Returns `None` when `id` is not a connector or either endpoint is gone;
    /// the renderer skips such connectors.
    #[must_use]
    pub fn resolve_connector(&self, id: &str) -> Option<(&CanvasObject, &CanvasObject)> {
        let connector = self.get(id)?;
        if connector.kind != ShapeKind::Connector {
            return None;
        }
        let from = self.get(connector.from_id.as_deref()?)?;
        let to = self.get(connector.to_id.as_deref()?)?;
        Some((from, to))
    }

    fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Insert or overwrite unconditionally. Overwrites keep their insertion slot.
    pub fn upsert(&mut self, object: CanvasObject) {
        self.put(object);
        self.publish();
    }

    /// Last-write-wins merge of a remote object.
    pub fn merge(&mut self, remote: CanvasObject) -> MergeOutcome {
        if !should_replace(self.get(&remote.id), &remote) {
            return MergeOutcome::Unchanged;
        }
        self.put(remote);
        self.publish();
        MergeOutcome::Changed
    }

    /// Mutate an object in place. Returns `None` if the id is absent.
    pub fn modify<R>(&mut self, id: &str, f: impl FnOnce(&mut CanvasObject) -> R) -> Option<R> {
        let slot = *self.index.get(id)?;
        let entry = self.slots[slot].as_mut()?;
        let result = f(&mut entry.object);
        self.publish();
        Some(result)
    }

    /// Remove regardless of timestamps.
    pub fn remove(&mut self, id: &str) -> Option<CanvasObject> {
        let slot = self.index.remove(id)?;
        let entry = self.slots[slot].take()?;
        self.free.push(slot);
        self.publish();
        Some(entry.object)
    }

    /// Replace the whole map with `objects`, in the given order.
    pub fn replace_all(&mut self, objects: impl IntoIterator<Item = CanvasObject>) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        for object in objects {
            self.put(object);
        }
        self.publish();
    }

    fn put(&mut self, object: CanvasObject) {
        if let Some(&slot) = self.index.get(&object.id) {
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.object = object;
                return;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = object.id.clone();
        let entry = Some(Entry { object, seq });
        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot] = entry;
            slot
        } else {
            self.slots.push(entry);
            self.slots.len() - 1
        };
        self.index.insert(id, slot);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}
