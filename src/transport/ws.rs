//! WebSocket client transport for the relay server.
//!
//! DESIGN
//! ======
//! One background task owns the socket. It connects, re-joins every board this
//! transport has subscribed to, re-tracks any published presence, then pumps
//! frames both ways until the socket drops. After a drop it reports
//! `Reconnecting`, fails every in-flight request, and retries with jittered
//! exponential backoff. After `DISCONNECT_AFTER_ATTEMPTS` consecutive failures
//! it reports `Disconnected` but keeps retrying.
//!
//! Requests (`object:list`, `object:persist`, `presence:*`) correlate to their
//! `done`/`error` reply by `parent_id` and time out after `REQUEST_TIMEOUT`.
//! Broadcasts are fire-and-forget and are dropped outright while the link is
//! down. Inbound pushes are routed to per-board subscriber queues with
//! `try_send`, so a slow consumer loses messages rather than stalling the
//! socket.
//!
//! Dropping the `WsTransport` closes the outbound queue, which ends the task.

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Inbound, PersistOp, PresenceInbound, Transport, TransportError};
use crate::config::SyncConfig;
use crate::connection::ConnectionStatus;
use crate::frame::{self, Data, Frame, Status};
use crate::message::{PresenceEvent, PresenceMeta, SyncMessage};
use crate::model::PersistedRecord;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_MAX_MS: u64 = 10_000;
const DISCONNECT_AFTER_ATTEMPTS: u32 = 3;

// =============================================================================
// SHARED STATE
// =============================================================================

#[derive(Default)]
struct BoardSubs {
    broadcast: Vec<mpsc::Sender<Value>>,
    changes: Vec<mpsc::Sender<Value>>,
    presence: Vec<mpsc::Sender<PresenceEvent>>,
    tracked: Option<PresenceMeta>,
}

struct Shared {
    status_tx: watch::Sender<ConnectionStatus>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Frame>>>,
    boards: Mutex<HashMap<String, BoardSubs>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Frame>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn boards(&self) -> MutexGuard<'_, HashMap<String, BoardSubs>> {
        self.boards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        *self.status_tx.borrow() == ConnectionStatus::Connected
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

pub struct WsTransport {
    shared: Arc<Shared>,
    out_tx: mpsc::UnboundedSender<Frame>,
    capacity: usize,
}

impl WsTransport {
    /// Start connecting to `url` (e.g. `ws://host:3000/api/ws`) in the
    /// background. Must be called inside a tokio runtime.
    #[must_use]
    pub fn connect(url: impl Into<String>, config: &SyncConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Reconnecting);
        let shared = Arc::new(Shared {
            status_tx,
            pending: Mutex::new(HashMap::new()),
            boards: Mutex::new(HashMap::new()),
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(url.into(), Arc::clone(&shared), out_rx));
        Self { shared, out_tx, capacity: config.inbound_capacity }
    }

    /// Send a request and wait for its terminal reply.
    async fn request(
        &self,
        syscall: &'static str,
        board_id: &str,
        data: Data,
    ) -> Result<Frame, TransportError> {
        if !self.shared.is_connected() {
            return Err(TransportError::Closed);
        }
        let frame = Frame::request(syscall, data).with_board_id(board_id);
        let id = frame.id;
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        if self.out_tx.send(frame).is_err() {
            self.shared.pending().remove(&id);
            return Err(TransportError::Closed);
        }

        let reply = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.shared.pending().remove(&id);
                return Err(TransportError::Timeout(syscall));
            }
        };
        match reply.status {
            Status::Error => Err(TransportError::Rejected(
                reply.error_message().unwrap_or("unknown error").to_owned(),
            )),
            _ => Ok(reply),
        }
    }

    /// Fire-and-forget frame; dropped while the link is down.
    fn send(&self, frame: Frame) {
        if self.shared.is_connected() {
            let _ = self.out_tx.send(frame);
        }
    }

    /// Register interest in a board, joining it on first use.
    fn with_board<R>(&self, board_id: &str, f: impl FnOnce(&mut BoardSubs) -> R) -> R {
        let mut boards = self.shared.boards();
        let is_new = !boards.contains_key(board_id);
        let subs = boards.entry(board_id.to_owned()).or_default();
        let result = f(subs);
        drop(boards);
        // Queued even while down: the connection task may be mid-rejoin.
        if is_new {
            let _ = self
                .out_tx
                .send(Frame::request(frame::BOARD_JOIN, Data::new()).with_board_id(board_id));
        }
        result
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn fetch_all(&self, board_id: &str) -> Result<Vec<PersistedRecord>, TransportError> {
        let reply = self.request(frame::OBJECT_LIST, board_id, Data::new()).await?;
        let objects = reply.data.get("objects").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(objects).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    async fn persist(&self, board_id: &str, op: PersistOp) -> Result<(), TransportError> {
        let mut data = Data::new();
        data.insert("op".into(), Value::from(op.label()));
        match op {
            PersistOp::Create(record) | PersistOp::Update(record) => {
                let object = serde_json::to_value(record).map_err(|e| TransportError::Malformed(e.to_string()))?;
                data.insert("object".into(), object);
            }
            PersistOp::Delete { id } => {
                data.insert("id".into(), Value::from(id));
            }
        }
        self.request(frame::OBJECT_PERSIST, board_id, data).await.map(|_| ())
    }

    fn subscribe_broadcast(&self, board_id: &str) -> Inbound {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.with_board(board_id, |subs| subs.broadcast.push(tx));
        rx
    }

    fn subscribe_change_stream(&self, board_id: &str) -> Inbound {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.with_board(board_id, |subs| subs.changes.push(tx));
        rx
    }

    fn send_broadcast(&self, board_id: &str, message: &SyncMessage) {
        let frame = Frame::request(frame::OBJECT_BROADCAST, Data::new())
            .with_board_id(board_id)
            .with_data("message", message.to_value());
        self.send(frame);
    }

    fn subscribe_presence(&self, board_id: &str) -> PresenceInbound {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.with_board(board_id, |subs| subs.presence.push(tx));
        rx
    }

    fn send_presence_broadcast(&self, board_id: &str, payload: Value) {
        let frame = Frame::request(frame::PRESENCE_BROADCAST, Data::new())
            .with_board_id(board_id)
            .with_data("payload", payload);
        self.send(frame);
    }

    async fn track(&self, board_id: &str, meta: PresenceMeta) -> Result<(), TransportError> {
        let value = serde_json::to_value(&meta).map_err(|e| TransportError::Malformed(e.to_string()))?;
        self.with_board(board_id, |subs| subs.tracked = Some(meta));
        let mut data = Data::new();
        data.insert("meta".into(), value);
        self.request(frame::PRESENCE_TRACK, board_id, data).await.map(|_| ())
    }

    async fn untrack(&self, board_id: &str) -> Result<(), TransportError> {
        if let Some(subs) = self.shared.boards().get_mut(board_id) {
            subs.tracked = None;
        }
        self.request(frame::PRESENCE_UNTRACK, board_id, Data::new()).await.map(|_| ())
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

async fn run(url: String, shared: Arc<Shared>, mut out_rx: mpsc::UnboundedReceiver<Frame>) {
    let mut failures: u32 = 0;
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                failures = 0;
                info!(url = %url, "ws transport: connected");
                let (mut sink, mut source) = stream.split();

                // Membership first, so replies and pushes route from the start.
                for frame in rejoin_frames(&shared) {
                    if let Ok(text) = serde_json::to_string(&frame) {
                        let _ = sink.send(Message::Text(text.into())).await;
                    }
                }
                shared.set_status(ConnectionStatus::Connected);

                let closed_by_owner = loop {
                    tokio::select! {
                        outbound = out_rx.recv() => {
                            let Some(frame) = outbound else { break true };
                            let Ok(text) = serde_json::to_string(&frame) else { continue };
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                warn!(error = %e, "ws transport: send failed");
                                break false;
                            }
                        }
                        inbound = source.next() => {
                            match inbound {
                                Some(Ok(Message::Text(text))) => dispatch(&shared, text.as_str()),
                                Some(Ok(Message::Close(_))) | None => break false,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "ws transport: receive failed");
                                    break false;
                                }
                            }
                        }
                    }
                };

                // Dropping the senders fails every in-flight request with `Closed`.
                shared.pending().clear();
                if closed_by_owner {
                    let _ = sink.close().await;
                    shared.set_status(ConnectionStatus::Disconnected);
                    return;
                }
                shared.set_status(ConnectionStatus::Reconnecting);
                info!(url = %url, "ws transport: connection lost");
            }
            Err(e) => {
                failures += 1;
                debug!(url = %url, attempt = failures, error = %e, "ws transport: connect failed");
                if failures >= DISCONNECT_AFTER_ATTEMPTS {
                    shared.set_status(ConnectionStatus::Disconnected);
                } else {
                    shared.set_status(ConnectionStatus::Reconnecting);
                }
            }
        }

        let delay = backoff(failures);
        // Frames queued while down are stale; the owner vanishing ends the task.
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => break,
                outbound = out_rx.recv() => {
                    if outbound.is_none() {
                        shared.set_status(ConnectionStatus::Disconnected);
                        return;
                    }
                }
            }
        }
    }
}

/// Exponential backoff with up to 50% random jitter.
fn backoff(failures: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << failures.min(6)).min(BACKOFF_MAX_MS);
    let jitter = rand::rng().random_range(0..=exp / 2);
    Duration::from_millis(exp + jitter)
}

/// Frames that restore membership and presence after (re)connecting.
fn rejoin_frames(shared: &Shared) -> Vec<Frame> {
    let boards = shared.boards();
    let mut frames = Vec::new();
    for (board_id, subs) in boards.iter() {
        frames.push(Frame::request(frame::BOARD_JOIN, Data::new()).with_board_id(board_id.as_str()));
        if let Some(meta) = &subs.tracked {
            if let Ok(value) = serde_json::to_value(meta) {
                frames.push(
                    Frame::request(frame::PRESENCE_TRACK, Data::new())
                        .with_board_id(board_id.as_str())
                        .with_data("meta", value),
                );
            }
        }
    }
    frames
}

// =============================================================================
// INBOUND DISPATCH
// =============================================================================

fn dispatch(shared: &Shared, text: &str) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "ws transport: dropping unparseable frame");
            return;
        }
    };

    if let Some(parent_id) = frame.parent_id {
        if frame.status.is_terminal() {
            if let Some(waiter) = shared.pending().remove(&parent_id) {
                let _ = waiter.send(frame);
            }
        }
        return;
    }

    if frame.syscall == frame::SESSION_CONNECTED {
        debug!(client_id = ?frame.data_str("client_id"), "ws transport: session established");
        return;
    }

    let Some(board_id) = frame.board_id.clone() else {
        return;
    };
    let mut boards = shared.boards();
    let Some(subs) = boards.get_mut(&board_id) else {
        return;
    };

    match frame.syscall.as_str() {
        frame::OBJECT_BROADCAST => {
            if let Some(message) = frame.data.get("message") {
                fan_out(&mut subs.broadcast, message);
            }
        }
        frame::CHANGE_STREAM => {
            if let Some(message) = frame.data.get("message") {
                fan_out(&mut subs.changes, message);
            }
        }
        frame::PRESENCE_SYNC => {
            let roster = frame.data.get("roster").cloned().unwrap_or_else(|| json!([]));
            match serde_json::from_value::<Vec<PresenceMeta>>(roster) {
                Ok(roster) => fan_out(&mut subs.presence, &PresenceEvent::Sync(roster)),
                Err(e) => debug!(error = %e, "ws transport: dropping malformed roster"),
            }
        }
        frame::PRESENCE_BROADCAST => {
            if let Some(payload) = frame.data.get("payload") {
                fan_out(&mut subs.presence, &PresenceEvent::Broadcast(payload.clone()));
            }
        }
        other => debug!(syscall = other, "ws transport: ignoring push"),
    }
}

/// Best-effort delivery; closed subscribers are pruned.
fn fan_out<T: Clone>(subscribers: &mut Vec<mpsc::Sender<T>>, value: &T) {
    subscribers.retain(|tx| !tx.is_closed());
    for tx in subscribers.iter() {
        if tx.try_send(value.clone()).is_err() {
            debug!("ws transport: subscriber queue full, dropping message");
        }
    }
}
