//! WebSocket handler: board relay.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Pushes from board peers → forward to client
//!
//! Handler functions are pure business logic. They validate, touch state,
//! and return an `Outcome`. The dispatch layer owns all outbound concerns:
//! reply to sender, push to peers, push to the whole room.
//!
//! PROTOCOL
//! ========
//! - `board:join` / `board:part`: room membership; both publish the roster.
//! - `object:list`: snapshot reply under `objects`.
//! - `object:persist`: durable write; an applied write is pushed to every
//!   room member (sender included) as `change:stream`.
//! - `object:broadcast`, `presence:broadcast`: relayed to peers only.
//! - `presence:track` / `presence:untrack`: roster change, `presence:sync`
//!   pushed to every room member.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome
//! 4. Close → part every joined board, publishing rosters that changed

use std::collections::HashSet;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use boardsync::frame::{self, Data, Frame};
use boardsync::{PersistOp, PersistedRecord, PresenceMeta};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services;
use crate::state::AppState;

/// Per-connection queue for pushes from board peers.
const CLIENT_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what; handlers never send frames directly.
#[derive(Debug)]
enum Outcome {
    /// Send empty done to sender only.
    Done,
    /// Send done+data to sender only.
    Reply(Data),
    /// Push data to all board peers EXCLUDING sender. No reply to sender.
    BroadcastExcludeSender(Data),
    /// Done to sender, then push `data` as `syscall` to every room member.
    DoneAndPublish { syscall: &'static str, data: Data },
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(CLIENT_QUEUE_CAPACITY);

    let welcome = Frame::push(frame::SESSION_CONNECTED, Data::new()).with_data("client_id", client_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, "ws: client connected");

    let mut joined: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut joined, client_id, &client_tx, text.as_str()).await;
                        for reply in replies {
                            let _ = send_frame(&mut socket, &reply).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    for board_id in joined {
        leave_board(&state, &board_id, client_id).await;
    }
    info!(%client_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
async fn process_inbound_text(
    state: &AppState,
    joined: &mut HashSet<String>,
    client_id: Uuid,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::push("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the connection as `from`.
    req.from = Some(client_id.to_string());

    let Some(board_id) = req.board_id.clone() else {
        return vec![req.error("board_id required")];
    };

    let result = if req.syscall == frame::BOARD_JOIN || req.syscall == frame::BOARD_PART {
        Ok(handle_board(state, joined, &board_id, client_id, client_tx, &req).await)
    } else if !joined.contains(&board_id) {
        Err(req.error("must join a board first"))
    } else {
        match req.prefix() {
            "object" => handle_object(state, &board_id, &req).await,
            "presence" => handle_presence(state, &board_id, client_id, &req).await,
            prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
        }
    };

    // The dispatch layer owns all outbound logic.
    match result {
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::BroadcastExcludeSender(data)) => {
            let push = Frame::push(&req.syscall, data).with_board_id(board_id.as_str()).with_from(client_id.to_string());
            services::board::broadcast(state, &board_id, &push, Some(client_id)).await;
            vec![]
        }
        Ok(Outcome::DoneAndPublish { syscall, data }) => {
            let push = Frame::push(syscall, data).with_board_id(board_id.as_str());
            services::board::broadcast(state, &board_id, &push, None).await;
            vec![req.done()]
        }
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// BOARD HANDLERS
// =============================================================================

async fn handle_board(
    state: &AppState,
    joined: &mut HashSet<String>,
    board_id: &str,
    client_id: Uuid,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Outcome {
    if req.syscall == frame::BOARD_JOIN {
        let roster = services::board::join_board(state, board_id, client_id, client_tx.clone()).await;
        joined.insert(board_id.to_owned());
        return Outcome::DoneAndPublish { syscall: frame::PRESENCE_SYNC, data: roster_data(&roster) };
    }

    if !joined.remove(board_id) {
        return Outcome::Done;
    }
    match services::board::part_board(state, board_id, client_id).await {
        Some(roster) => Outcome::DoneAndPublish { syscall: frame::PRESENCE_SYNC, data: roster_data(&roster) },
        None => Outcome::Done,
    }
}

/// Part on disconnect; there is no sender left to reply to.
async fn leave_board(state: &AppState, board_id: &str, client_id: Uuid) {
    if let Some(roster) = services::board::part_board(state, board_id, client_id).await {
        let push = Frame::push(frame::PRESENCE_SYNC, roster_data(&roster)).with_board_id(board_id);
        services::board::broadcast(state, board_id, &push, None).await;
    }
}

// =============================================================================
// OBJECT HANDLERS
// =============================================================================

async fn handle_object(state: &AppState, board_id: &str, req: &Frame) -> Result<Outcome, Frame> {
    match req.syscall.as_str() {
        frame::OBJECT_LIST => match services::object::list_objects(state, board_id).await {
            Ok(objects) => {
                let mut data = Data::new();
                data.insert("objects".into(), serde_json::to_value(&objects).unwrap_or_else(|_| json!([])));
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        frame::OBJECT_PERSIST => {
            let op = parse_persist_op(req)?;
            match services::object::persist(state, board_id, op).await {
                Ok(Some(message)) => {
                    let mut data = Data::new();
                    data.insert("message".into(), message.to_value());
                    Ok(Outcome::DoneAndPublish { syscall: frame::CHANGE_STREAM, data })
                }
                Ok(None) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        frame::OBJECT_BROADCAST => {
            let Some(message) = req.data.get("message") else {
                return Err(req.error("message required"));
            };
            let mut data = Data::new();
            data.insert("message".into(), message.clone());
            Ok(Outcome::BroadcastExcludeSender(data))
        }
        other => Err(req.error(format!("unknown object op: {other}"))),
    }
}

fn parse_persist_op(req: &Frame) -> Result<PersistOp, Frame> {
    let record = || -> Result<PersistedRecord, Frame> {
        let object = req.data.get("object").cloned().unwrap_or(Value::Null);
        serde_json::from_value(object).map_err(|e| req.error(format!("invalid object: {e}")))
    };
    match req.data_str("op") {
        Some("create") => Ok(PersistOp::Create(record()?)),
        Some("update") => Ok(PersistOp::Update(record()?)),
        Some("delete") => {
            let Some(id) = req.data_str("id") else {
                return Err(req.error("id required"));
            };
            Ok(PersistOp::Delete { id: id.to_owned() })
        }
        Some(op) => Err(req.error(format!("unknown persist op: {op}"))),
        None => Err(req.error("op required")),
    }
}

// =============================================================================
// PRESENCE HANDLERS
// =============================================================================

async fn handle_presence(state: &AppState, board_id: &str, client_id: Uuid, req: &Frame) -> Result<Outcome, Frame> {
    match req.syscall.as_str() {
        frame::PRESENCE_TRACK => {
            let meta = req.data.get("meta").cloned().unwrap_or(Value::Null);
            let meta: PresenceMeta =
                serde_json::from_value(meta).map_err(|e| req.error(format!("invalid meta: {e}")))?;
            let Some(roster) = services::board::track(state, board_id, client_id, meta).await else {
                return Err(req.error("must join a board first"));
            };
            Ok(Outcome::DoneAndPublish { syscall: frame::PRESENCE_SYNC, data: roster_data(&roster) })
        }
        frame::PRESENCE_UNTRACK => {
            let roster = services::board::untrack(state, board_id, client_id).await;
            Ok(Outcome::DoneAndPublish { syscall: frame::PRESENCE_SYNC, data: roster_data(&roster) })
        }
        frame::PRESENCE_BROADCAST => {
            let Some(payload) = req.data.get("payload") else {
                return Err(req.error("payload required"));
            };
            let mut data = Data::new();
            data.insert("payload".into(), payload.clone());
            Ok(Outcome::BroadcastExcludeSender(data))
        }
        other => Err(req.error(format!("unknown presence op: {other}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn roster_data(roster: &[PresenceMeta]) -> Data {
    let mut data = Data::new();
    data.insert("roster".into(), serde_json::to_value(roster).unwrap_or_else(|_| json!([])));
    data
}

/// Broadcast relays are high-volume; log them at debug.
fn is_chatty(frame: &Frame) -> bool {
    frame.syscall == frame::OBJECT_BROADCAST || frame.syscall == frame::PRESENCE_BROADCAST
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == frame::Status::Error {
        let code = frame.data_str(frame::FRAME_CODE).unwrap_or("-");
        let message = frame.error_message().unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else if is_chatty(frame) {
        tracing::debug!(id = %frame.id, syscall = %frame.syscall, "ws: send frame");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
