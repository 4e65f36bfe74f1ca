//! Who is on the board and where their pointers are.
//!
//! DESIGN
//! ======
//! Two inputs feed the roster, and they are not ordered relative to each
//! other:
//!
//! - **Presence sync**: a full roster snapshot from the transport. It replaces
//!   the local set wholesale and is the only way participants join or leave.
//! - **Cursor broadcast**: a fast-path pointer update from one peer. It only
//!   ever touches the cursor of a known participant. A cursor for someone the
//!   roster has not introduced yet is buffered and applied the moment a sync
//!   brings them in.
//!
//! Outbound cursor moves go through a trailing-edge `Throttle`, so the last
//! position (including "not hovering") is always delivered.

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::message::{CursorPayload, PresenceMeta};
use crate::model::Point;
use crate::throttle::Throttle;
use crate::transport::{Transport, TransportError};

/// Cursor palette, indexed by `cursor_color`'s hash.
pub const CURSOR_COLORS: [&str; 8] = [
    "#ef4444", // red
    "#f97316", // orange
    "#eab308", // yellow
    "#22c55e", // green
    "#06b6d4", // cyan
    "#3b82f6", // blue
    "#8b5cf6", // violet
    "#ec4899", // pink
];

const ANONYMOUS: &str = "Anonymous";

/// Deterministic palette color for a participant. Stable across processes;
/// collisions are fine.
#[must_use]
pub fn cursor_color(participant_id: &str) -> &'static str {
    let hash = participant_id
        .encode_utf16()
        .fold(0i32, |h, unit| (h << 5).wrapping_sub(h).wrapping_add(i32::from(unit)));
    CURSOR_COLORS[(hash.unsigned_abs() % 8) as usize]
}

/// One remote participant as the board should draw them.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub participant_id: String,
    pub display_name: String,
    /// `None` means the participant's pointer is off the canvas.
    pub cursor: Option<Point>,
    pub color: &'static str,
}

/// Immutable view of everyone else on the board.
pub type Roster = Arc<Vec<PresenceEntry>>;

pub struct PresenceTracker {
    board_id: String,
    participant_id: String,
    display_name: String,
    transport: Arc<dyn Transport>,
    others: Vec<PresenceEntry>,
    pending: HashMap<String, Option<Point>>,
    pending_limit: usize,
    throttle: Throttle<Option<Point>>,
    roster_tx: watch::Sender<Roster>,
}

impl PresenceTracker {
    pub fn new(
        transport: Arc<dyn Transport>,
        board_id: impl Into<String>,
        participant_id: impl Into<String>,
        display_name: impl Into<String>,
        config: &SyncConfig,
    ) -> Self {
        let (roster_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            board_id: board_id.into(),
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            transport,
            others: Vec::new(),
            pending: HashMap::new(),
            pending_limit: config.pending_cursor_limit,
            throttle: Throttle::new(config.cursor_interval),
            roster_tx,
        }
    }

    #[must_use]
    pub fn others(&self) -> &[PresenceEntry] {
        &self.others
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Roster> {
        self.roster_tx.subscribe()
    }

    // =========================================================================
    // PRESENCE
    // =========================================================================

    /// Publish ourselves on the board. Called on every (re)connect; repeating
    /// it only replaces our meta.
    pub async fn announce(&self) -> Result<(), TransportError> {
        let meta = PresenceMeta {
            participant_id: self.participant_id.clone(),
            display_name: Some(self.display_name.clone()),
            cursor: None,
        };
        self.transport.track(&self.board_id, meta).await
    }

    /// Withdraw from the board and forget everyone else.
    pub async fn leave(&mut self) -> Result<(), TransportError> {
        self.forget_others();
        self.transport.untrack(&self.board_id).await
    }

    /// Our link went down: peers and their cursors are no longer live. The
    /// next sync after reconnecting rebuilds the roster from scratch.
    pub fn on_link_lost(&mut self) {
        if self.others.is_empty() && self.pending.is_empty() {
            return;
        }
        debug!(board_id = %self.board_id, "presence: link lost, clearing roster");
        self.forget_others();
    }

    fn forget_others(&mut self) {
        self.others.clear();
        self.pending.clear();
        self.publish();
    }

    /// Replace the roster from a full snapshot.
    ///
    /// Cursor precedence per participant: the cursor we already hold for them,
    /// then a buffered broadcast, then whatever the snapshot carries.
    pub fn on_presence_sync(&mut self, roster: Vec<PresenceMeta>) {
        let mut previous: HashMap<String, Option<Point>> = self
            .others
            .drain(..)
            .map(|e| (e.participant_id, e.cursor))
            .collect();

        let mut next: Vec<PresenceEntry> = Vec::with_capacity(roster.len());
        for meta in roster {
            if meta.participant_id == self.participant_id {
                continue;
            }
            let cursor = previous
                .remove(&meta.participant_id)
                .or_else(|| self.pending.remove(&meta.participant_id))
                .unwrap_or(meta.cursor);
            let entry = PresenceEntry {
                color: cursor_color(&meta.participant_id),
                display_name: meta
                    .display_name
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| ANONYMOUS.to_owned()),
                participant_id: meta.participant_id,
                cursor,
            };
            // Several connections may share an id; the latest meta wins.
            match next.iter_mut().find(|e| e.participant_id == entry.participant_id) {
                Some(existing) => *existing = entry,
                None => next.push(entry),
            }
        }

        self.others = next;
        self.publish();
    }

    // =========================================================================
    // CURSORS
    // =========================================================================

    /// Fast-path cursor update from a peer's presence broadcast.
    pub fn on_cursor_broadcast(&mut self, payload: serde_json::Value) {
        let Some(CursorPayload { sender_id, cursor }) = CursorPayload::decode(payload) else {
            return;
        };
        if sender_id == self.participant_id {
            return;
        }
        if let Some(entry) = self.others.iter_mut().find(|e| e.participant_id == sender_id) {
            if entry.cursor != cursor {
                entry.cursor = cursor;
                self.publish();
            }
            return;
        }
        if self.pending.len() >= self.pending_limit && !self.pending.contains_key(&sender_id) {
            debug!(sender_id = %sender_id, "presence: pending cursor buffer full, dropping");
            return;
        }
        self.pending.insert(sender_id, cursor);
    }

    /// Rate-limited broadcast of our pointer. `None` signals pointer-leave.
    pub fn send_cursor(&mut self, cursor: Option<Point>, now: Instant) {
        if let Some(cursor) = self.throttle.call(cursor, now) {
            self.emit_cursor(cursor);
        }
    }

    /// Send the trailing cursor update if its window has closed.
    pub fn flush_cursor(&mut self, now: Instant) {
        if let Some(cursor) = self.throttle.flush(now) {
            self.emit_cursor(cursor);
        }
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.throttle.deadline()
    }

    fn emit_cursor(&self, cursor: Option<Point>) {
        let payload = CursorPayload { sender_id: self.participant_id.clone(), cursor };
        match serde_json::to_value(&payload) {
            Ok(value) => self.transport.send_presence_broadcast(&self.board_id, value),
            Err(e) => warn!(error = %e, "presence: failed to encode cursor"),
        }
    }

    fn publish(&self) {
        self.roster_tx.send_replace(Arc::new(self.others.clone()));
    }
}
