//! Board service: room membership, presence roster, and fan-out.
//!
//! DESIGN
//! ======
//! A room exists while at least one client is joined and is evicted when the
//! last one parts. Presence is tracked per client, so a participant with two
//! tabs open appears twice and the client-side roster keeps the latest meta.
//! Every membership or roster change returns the resulting roster so the
//! caller can publish a `presence:sync`.

#[cfg(test)]
#[path = "board_test.rs"]
mod tests;

use boardsync::PresenceMeta;
use boardsync::frame::Frame;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::state::AppState;

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Join `board_id`, replacing any earlier sender for the same client.
/// Returns the current roster.
pub async fn join_board(
    state: &AppState,
    board_id: &str,
    client_id: Uuid,
    tx: mpsc::Sender<Frame>,
) -> Vec<PresenceMeta> {
    let mut boards = state.boards.write().await;
    let room = boards.entry(board_id.to_owned()).or_default();
    room.clients.insert(client_id, tx);
    info!(%board_id, %client_id, clients = room.clients.len(), "client joined board");
    room.roster()
}

/// Leave `board_id`. Returns the remaining roster if the client had tracked
/// presence there, so peers need a `presence:sync`.
pub async fn part_board(state: &AppState, board_id: &str, client_id: Uuid) -> Option<Vec<PresenceMeta>> {
    let mut boards = state.boards.write().await;
    let room = boards.get_mut(board_id)?;

    room.clients.remove(&client_id);
    let was_tracked = room.roster.remove(&client_id).is_some();
    info!(%board_id, %client_id, remaining = room.clients.len(), "client left board");

    if room.clients.is_empty() {
        boards.remove(board_id);
        info!(%board_id, "evicted board room");
        return None;
    }
    was_tracked.then(|| room.roster())
}

// =============================================================================
// PRESENCE
// =============================================================================

/// Publish `meta` for `client_id`. Returns `None` if the client is not joined.
pub async fn track(
    state: &AppState,
    board_id: &str,
    client_id: Uuid,
    meta: PresenceMeta,
) -> Option<Vec<PresenceMeta>> {
    let mut boards = state.boards.write().await;
    let room = boards.get_mut(board_id)?;
    if !room.clients.contains_key(&client_id) {
        return None;
    }
    room.roster.insert(client_id, meta);
    Some(room.roster())
}

/// Withdraw `client_id`'s presence. Returns the resulting roster.
pub async fn untrack(state: &AppState, board_id: &str, client_id: Uuid) -> Vec<PresenceMeta> {
    let mut boards = state.boards.write().await;
    let Some(room) = boards.get_mut(board_id) else {
        return Vec::new();
    };
    room.roster.remove(&client_id);
    room.roster()
}

// =============================================================================
// FAN-OUT
// =============================================================================

/// Send `frame` to every client on `board_id` except `exclude`.
pub async fn broadcast(state: &AppState, board_id: &str, frame: &Frame, exclude: Option<Uuid>) {
    let boards = state.boards.read().await;
    let Some(room) = boards.get(board_id) else {
        return;
    };

    for (client_id, tx) in &room.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        if tx.try_send(frame.clone()).is_err() {
            debug!(%board_id, %client_id, syscall = %frame.syscall, "client queue full, dropping frame");
        }
    }
}
