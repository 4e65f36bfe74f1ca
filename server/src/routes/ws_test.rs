use super::*;
use crate::state::test_helpers;
use boardsync::frame::Status;
use boardsync::{
    BoardSession, CanvasObject, Indicator, Participant, ShapeKind, SyncConfig, SyncMessage, SystemClock, Timestamp,
    Transport, WsTransport,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};

const BOARD: &str = "board-1";

struct Client {
    id: Uuid,
    joined: HashSet<String>,
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl Client {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self { id: Uuid::new_v4(), joined: HashSet::new(), tx, rx }
    }

    async fn send(&mut self, state: &AppState, syscall: &str, data: Data) -> Vec<Frame> {
        let req = Frame::request(syscall, data).with_board_id(BOARD);
        let text = serde_json::to_string(&req).unwrap();
        process_inbound_text(state, &mut self.joined, self.id, &self.tx, &text).await
    }

    async fn join(&mut self, state: &AppState) {
        let replies = self.send(state, frame::BOARD_JOIN, Data::new()).await;
        assert_eq!(replies[0].status, Status::Done);
    }

    /// Next pushed frame with `syscall`, skipping anything else.
    async fn recv(&mut self, syscall: &str) -> Frame {
        timeout(Duration::from_millis(500), async {
            loop {
                let frame = self.rx.recv().await.expect("client channel closed");
                if frame.syscall == syscall {
                    return frame;
                }
            }
        })
        .await
        .expect("push receive timed out")
    }

    /// Next `presence:sync` whose roster satisfies `pred`.
    async fn recv_roster(&mut self, pred: impl Fn(&Vec<Value>) -> bool) -> Vec<Value> {
        timeout(Duration::from_millis(500), async {
            loop {
                let sync = self.recv(frame::PRESENCE_SYNC).await;
                let roster = sync.data["roster"].as_array().cloned().unwrap_or_default();
                if pred(&roster) {
                    return roster;
                }
            }
        })
        .await
        .expect("roster receive timed out")
    }

    async fn assert_no_push(&mut self, syscall: &str) {
        let found = timeout(Duration::from_millis(80), async {
            loop {
                let frame = self.rx.recv().await.expect("client channel closed");
                if frame.syscall == syscall {
                    return frame;
                }
            }
        })
        .await;
        assert!(found.is_err(), "unexpected {syscall} push");
    }
}

fn record(id: &str, stamp: &str) -> PersistedRecord {
    PersistedRecord {
        id: id.into(),
        board_id: BOARD.into(),
        kind: "rectangle".into(),
        attributes: json!({"fill": "#60a5fa"}),
        x: 0.0,
        y: 0.0,
        width: 120.0,
        height: 80.0,
        stack_order: 0,
        creator_id: None,
        last_modified: Timestamp::new(stamp),
    }
}

fn persist_data(op: &str, record: &PersistedRecord) -> Data {
    let mut data = Data::new();
    data.insert("op".into(), json!(op));
    data.insert("object".into(), serde_json::to_value(record).unwrap());
    data
}

fn meta_data(id: &str) -> Data {
    let mut data = Data::new();
    data.insert("meta".into(), json!({"participant_id": id, "display_name": id}));
    data
}

// =============================================================================
// DISPATCH
// =============================================================================

#[tokio::test]
async fn invalid_json_returns_gateway_error() {
    let state = test_helpers::test_app_state();
    let mut client = Client::new();
    let replies = process_inbound_text(&state, &mut client.joined, client.id, &client.tx, "{nope").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].syscall, "gateway:error");
}

#[tokio::test]
async fn board_id_is_required() {
    let state = test_helpers::test_app_state();
    let mut client = Client::new();
    let text = serde_json::to_string(&Frame::request(frame::OBJECT_LIST, Data::new())).unwrap();
    let replies = process_inbound_text(&state, &mut client.joined, client.id, &client.tx, &text).await;
    assert_eq!(replies[0].status, Status::Error);
    assert_eq!(replies[0].error_message(), Some("board_id required"));
}

#[tokio::test]
async fn object_ops_require_join() {
    let state = test_helpers::test_app_state();
    let mut client = Client::new();
    let replies = client.send(&state, frame::OBJECT_LIST, Data::new()).await;
    assert_eq!(replies[0].status, Status::Error);
    assert_eq!(replies[0].error_message(), Some("must join a board first"));
}

#[tokio::test]
async fn unknown_prefix_is_rejected() {
    let state = test_helpers::test_app_state();
    let mut client = Client::new();
    client.join(&state).await;
    let replies = client.send(&state, "chat:message", Data::new()).await;
    assert_eq!(replies[0].status, Status::Error);
}

#[tokio::test]
async fn join_publishes_current_roster() {
    let state = test_helpers::test_app_state();
    let mut alice = Client::new();
    alice.join(&state).await;
    alice.send(&state, frame::PRESENCE_TRACK, meta_data("alice")).await;

    let mut bob = Client::new();
    bob.join(&state).await;
    let sync = bob.recv(frame::PRESENCE_SYNC).await;
    assert_eq!(sync.data["roster"][0]["participant_id"], "alice");
}

#[tokio::test]
async fn applied_persist_reaches_whole_room() {
    let state = test_helpers::test_app_state();
    let mut alice = Client::new();
    let mut bob = Client::new();
    alice.join(&state).await;
    bob.join(&state).await;

    let rec = record("r1", "2024-01-01T00:00:00.001Z");
    let replies = alice.send(&state, frame::OBJECT_PERSIST, persist_data("create", &rec)).await;
    assert_eq!(replies[0].status, Status::Done);

    for client in [&mut alice, &mut bob] {
        let push = client.recv(frame::CHANGE_STREAM).await;
        assert_eq!(push.status, Status::Item);
        assert!(push.parent_id.is_none());
        let message = SyncMessage::decode(push.data["message"].clone()).unwrap();
        assert_eq!(message, SyncMessage::Create { object: rec.clone() });
    }
}

#[tokio::test]
async fn stale_persist_is_acknowledged_but_not_published() {
    let state = test_helpers::test_app_state();
    let mut alice = Client::new();
    alice.join(&state).await;
    alice
        .send(&state, frame::OBJECT_PERSIST, persist_data("create", &record("r1", "2024-01-01T00:00:00.005Z")))
        .await;
    alice.recv(frame::CHANGE_STREAM).await;

    let replies = alice
        .send(&state, frame::OBJECT_PERSIST, persist_data("update", &record("r1", "2024-01-01T00:00:00.004Z")))
        .await;
    assert_eq!(replies[0].status, Status::Done);
    alice.assert_no_push(frame::CHANGE_STREAM).await;
}

#[tokio::test]
async fn persist_validates_payload() {
    let state = test_helpers::test_app_state();
    let mut alice = Client::new();
    alice.join(&state).await;

    let mut data = Data::new();
    data.insert("op".into(), json!("create"));
    data.insert("object".into(), json!({"id": "r1"}));
    let replies = alice.send(&state, frame::OBJECT_PERSIST, data).await;
    assert_eq!(replies[0].status, Status::Error);

    let mut data = Data::new();
    data.insert("op".into(), json!("delete"));
    let replies = alice.send(&state, frame::OBJECT_PERSIST, data).await;
    assert_eq!(replies[0].error_message(), Some("id required"));

    let mut other = record("r1", "2024-01-01T00:00:00.001Z");
    other.board_id = "board-2".into();
    let replies = alice.send(&state, frame::OBJECT_PERSIST, persist_data("create", &other)).await;
    assert_eq!(replies[0].data_str(frame::FRAME_CODE), Some("E_BOARD_MISMATCH"));
}

#[tokio::test]
async fn list_replies_with_stored_objects() {
    let state = test_helpers::test_app_state();
    let mut alice = Client::new();
    alice.join(&state).await;
    let rec = record("r1", "2024-01-01T00:00:00.001Z");
    alice.send(&state, frame::OBJECT_PERSIST, persist_data("create", &rec)).await;

    let replies = alice.send(&state, frame::OBJECT_LIST, Data::new()).await;
    let objects: Vec<PersistedRecord> = serde_json::from_value(replies[0].data["objects"].clone()).unwrap();
    assert_eq!(objects, vec![rec]);
}

#[tokio::test]
async fn broadcasts_reach_peers_only() {
    let state = test_helpers::test_app_state();
    let mut alice = Client::new();
    let mut bob = Client::new();
    alice.join(&state).await;
    bob.join(&state).await;

    let message = SyncMessage::Delete { id: "r1".into() }.to_value();
    let mut data = Data::new();
    data.insert("message".into(), message.clone());
    let replies = alice.send(&state, frame::OBJECT_BROADCAST, data).await;
    assert!(replies.is_empty());

    let push = bob.recv(frame::OBJECT_BROADCAST).await;
    assert_eq!(push.data["message"], message);
    assert_eq!(push.from.as_deref(), Some(alice.id.to_string().as_str()));
    alice.assert_no_push(frame::OBJECT_BROADCAST).await;

    let mut data = Data::new();
    data.insert("payload".into(), json!({"sender_id": "alice", "cursor": {"x": 1.0, "y": 2.0}}));
    alice.send(&state, frame::PRESENCE_BROADCAST, data).await;
    let push = bob.recv(frame::PRESENCE_BROADCAST).await;
    assert_eq!(push.data["payload"]["sender_id"], "alice");
    alice.assert_no_push(frame::PRESENCE_BROADCAST).await;
}

#[tokio::test]
async fn track_and_untrack_sync_everyone() {
    let state = test_helpers::test_app_state();
    let mut alice = Client::new();
    let mut bob = Client::new();
    alice.join(&state).await;
    bob.join(&state).await;

    let replies = alice.send(&state, frame::PRESENCE_TRACK, meta_data("alice")).await;
    assert_eq!(replies[0].status, Status::Done);
    for client in [&mut alice, &mut bob] {
        let roster = client.recv_roster(|r| !r.is_empty()).await;
        assert_eq!(roster[0]["participant_id"], "alice");
    }

    alice.send(&state, frame::PRESENCE_UNTRACK, Data::new()).await;
    bob.recv_roster(Vec::is_empty).await;
}

#[tokio::test]
async fn part_publishes_roster_to_remaining_members() {
    let state = test_helpers::test_app_state();
    let mut alice = Client::new();
    let mut bob = Client::new();
    alice.join(&state).await;
    bob.join(&state).await;
    alice.send(&state, frame::PRESENCE_TRACK, meta_data("alice")).await;
    bob.recv_roster(|r| r.len() == 1).await;

    let replies = alice.send(&state, frame::BOARD_PART, Data::new()).await;
    assert_eq!(replies[0].status, Status::Done);
    bob.recv_roster(Vec::is_empty).await;

    let replies = alice.send(&state, frame::OBJECT_LIST, Data::new()).await;
    assert_eq!(replies[0].status, Status::Error);
}

// =============================================================================
// END TO END
// =============================================================================

async fn spawn_server() -> (String, AppState) {
    let state = test_helpers::test_app_state();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = crate::routes::app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}/api/ws"), state)
}

async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, mut pred: impl FnMut(&T) -> bool) -> T {
    timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            rx.changed().await.expect("sender dropped");
        }
    })
    .await
    .expect("condition not reached in time")
}

#[tokio::test]
async fn raw_socket_handshake_and_join() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (url, _state) = spawn_server().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let next_frame = |msg: WsMessage| -> Frame { serde_json::from_str(msg.to_text().unwrap()).unwrap() };

    let welcome = next_frame(socket.next().await.unwrap().unwrap());
    assert_eq!(welcome.syscall, frame::SESSION_CONNECTED);
    assert!(welcome.data_str("client_id").is_some());

    let join = Frame::request(frame::BOARD_JOIN, Data::new()).with_board_id(BOARD);
    socket.send(WsMessage::Text(serde_json::to_string(&join).unwrap().into())).await.unwrap();

    let reply = next_frame(socket.next().await.unwrap().unwrap());
    assert_eq!(reply.parent_id, Some(join.id));
    assert_eq!(reply.status, Status::Done);
}

#[tokio::test]
async fn sessions_over_websocket_converge() {
    let (url, state) = spawn_server().await;
    let config = SyncConfig::default();
    let open = |id: &str| {
        BoardSession::spawn(
            Arc::new(WsTransport::connect(url.as_str(), &config)) as Arc<dyn Transport>,
            Arc::new(SystemClock::new()),
            config,
            BOARD,
            Participant::new(id, id),
        )
        .0
    };
    let alice = open("alice");
    let bob = open("bob");

    // Both connected and announced.
    let mut alice_roster = alice.roster();
    wait_for(&mut alice_roster, |r| r.iter().any(|e| e.participant_id == "bob")).await;
    let mut bob_roster = bob.roster();
    wait_for(&mut bob_roster, |r| r.iter().any(|e| e.participant_id == "alice")).await;

    alice
        .create(CanvasObject::new(ShapeKind::StickyNote, 5.0, 5.0).with_id("note"))
        .await
        .unwrap();
    let mut bob_view = bob.snapshot();
    wait_for(&mut bob_view, |s| s.iter().any(|o| o.id == "note")).await;

    alice.close().await;
    assert_eq!(state.store.list(BOARD).await.unwrap().len(), 1);
    wait_for(&mut bob_roster, |r| r.is_empty()).await;

    // A late joiner loads the stored board.
    let carol = open("carol");
    let mut carol_view = carol.snapshot();
    wait_for(&mut carol_view, |s| s.iter().any(|o| o.id == "note")).await;
}

#[tokio::test]
async fn fresh_websocket_session_shows_no_banner() {
    let (url, _state) = spawn_server().await;
    let config = SyncConfig::default();
    let open = |id: &str| {
        BoardSession::spawn(
            Arc::new(WsTransport::connect(url.as_str(), &config)) as Arc<dyn Transport>,
            Arc::new(SystemClock::new()),
            config,
            BOARD,
            Participant::new(id, id),
        )
        .0
    };
    let alice = open("alice");
    let mut indicator = alice.indicator();
    assert_eq!(*indicator.borrow_and_update(), Indicator::Hidden);

    // Alice only announces after handling her first connect, so once bob
    // sees her the transition has been processed.
    let bob = open("bob");
    let mut bob_roster = bob.roster();
    wait_for(&mut bob_roster, |r| r.iter().any(|e| e.participant_id == "alice")).await;

    assert!(!indicator.has_changed().unwrap());
    assert_eq!(*indicator.borrow(), Indicator::Hidden);
}
