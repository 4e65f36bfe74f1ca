use std::time::Duration;

use super::*;
use crate::clock::SystemClock;
use crate::model::ShapeKind;
use crate::transport::memory::{MemoryHub, MemoryTransport};

const BOARD: &str = "board-1";

fn open(hub: &MemoryHub, id: &str) -> (SessionHandle, Arc<MemoryTransport>) {
    let transport = Arc::new(hub.connect());
    let (handle, _task) = BoardSession::spawn(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(SystemClock::new()),
        SyncConfig::default(),
        BOARD,
        Participant::new(id, id.to_uppercase()),
    );
    (handle, transport)
}

async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, mut pred: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            rx.changed().await.expect("session ended");
        }
    })
    .await
    .expect("condition not reached in time")
}

fn has(snapshot: &Snapshot, id: &str) -> bool {
    snapshot.iter().any(|o| o.id == id)
}

#[tokio::test]
async fn peers_converge_on_created_objects() {
    let hub = MemoryHub::default();
    let (a, _) = open(&hub, "alice");
    let (b, _) = open(&hub, "bob");

    a.create(CanvasObject::new(ShapeKind::StickyNote, 1.0, 2.0).with_id("n1")).await.unwrap();

    let mut b_view = b.snapshot();
    let seen = wait_for(&mut b_view, |s| has(s, "n1")).await;
    assert_eq!(seen[0].kind, ShapeKind::StickyNote);

    // Separate clocks; keep bob's stamp strictly later than alice's.
    tokio::time::sleep(Duration::from_millis(5)).await;
    b.update("n1", ObjectPatch::position(9.0, 9.0)).await.unwrap();
    let mut a_view = a.snapshot();
    wait_for(&mut a_view, |s| s.iter().any(|o| o.id == "n1" && o.x == 9.0)).await;
}

#[tokio::test]
async fn creates_stack_on_top() {
    let hub = MemoryHub::default();
    let (a, _) = open(&hub, "alice");
    let first = a.create(CanvasObject::new(ShapeKind::Rectangle, 0.0, 0.0)).await.unwrap();
    let second = a.create(CanvasObject::new(ShapeKind::Rectangle, 0.0, 0.0)).await.unwrap();
    assert_eq!(first.stack_order, 0);
    assert_eq!(second.stack_order, 1);
}

#[tokio::test]
async fn late_joiner_loads_existing_board() {
    let hub = MemoryHub::default();
    let (a, _) = open(&hub, "alice");
    a.create(CanvasObject::new(ShapeKind::Circle, 0.0, 0.0).with_id("c1")).await.unwrap();
    a.close().await;

    let (b, _) = open(&hub, "bob");
    let mut view = b.snapshot();
    wait_for(&mut view, |s| has(s, "c1")).await;
}

#[tokio::test]
async fn reconnect_reloads_missed_changes() {
    let hub = MemoryHub::default();
    let (a, _) = open(&hub, "alice");
    let (b, b_link) = open(&hub, "bob");
    let mut b_indicator = b.indicator();

    b_link.set_status(ConnectionStatus::Reconnecting);
    wait_for(&mut b_indicator, |i| *i == Indicator::Reconnecting).await;

    a.create(CanvasObject::new(ShapeKind::Diamond, 0.0, 0.0).with_id("missed")).await.unwrap();
    // Give the write time to land while bob is offline.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!has(&b.snapshot().borrow(), "missed"));

    b_link.set_status(ConnectionStatus::Connected);
    wait_for(&mut b_indicator, |i| *i == Indicator::BackOnline).await;
    let mut view = b.snapshot();
    wait_for(&mut view, |s| has(s, "missed")).await;
}

#[tokio::test]
async fn presence_rosters_exclude_self() {
    let hub = MemoryHub::default();
    let (a, _) = open(&hub, "alice");
    let (b, _) = open(&hub, "bob");

    let mut a_roster = a.roster();
    let roster = wait_for(&mut a_roster, |r| r.len() == 1).await;
    assert_eq!(roster[0].participant_id, "bob");
    assert_eq!(roster[0].display_name, "BOB");

    let mut b_roster = b.roster();
    wait_for(&mut b_roster, |r| r.iter().any(|e| e.participant_id == "alice")).await;

    b.close().await;
    wait_for(&mut a_roster, |r| r.is_empty()).await;
}

#[tokio::test]
async fn cursors_reach_peers() {
    let hub = MemoryHub::default();
    let (a, _) = open(&hub, "alice");
    let (b, _) = open(&hub, "bob");
    let mut b_roster = b.roster();
    wait_for(&mut b_roster, |r| r.len() == 1).await;

    a.cursor(Some(Point::new(12.0, 34.0)));
    wait_for(&mut b_roster, |r| r.first().and_then(|e| e.cursor) == Some(Point::new(12.0, 34.0))).await;

    a.cursor(None);
    wait_for(&mut b_roster, |r| r.first().is_some_and(|e| e.cursor.is_none())).await;
}

#[tokio::test]
async fn applied_unit_of_work_undoes_as_one_step() {
    let hub = MemoryHub::default();
    let (a, _) = open(&hub, "alice");
    a.create(CanvasObject::new(ShapeKind::Rectangle, 10.0, 0.0).with_id("base")).await.unwrap();

    let recorded = a
        .apply(vec![
            MutationIntent::Create(CanvasObject::new(ShapeKind::Text, 0.0, 0.0).with_id("label")),
            MutationIntent::Update { id: "base".into(), patch: ObjectPatch::position(50.0, 0.0) },
            MutationIntent::Delete { id: "ghost".into() },
        ])
        .await
        .unwrap();
    assert_eq!(recorded, 2);

    assert!(a.undo().await.unwrap());
    let snap = a.snapshot().borrow().clone();
    assert!(!has(&snap, "label"));
    assert_eq!(snap.iter().find(|o| o.id == "base").unwrap().x, 10.0);

    assert!(a.redo().await.unwrap());
    let snap = a.snapshot().borrow().clone();
    assert!(has(&snap, "label"));
    assert_eq!(snap.iter().find(|o| o.id == "base").unwrap().x, 50.0);

    // Direct edits are not part of undo history.
    assert!(a.undo().await.unwrap());
    assert!(!a.undo().await.unwrap());
}

#[tokio::test]
async fn closed_session_rejects_commands() {
    let hub = MemoryHub::default();
    let (a, _) = open(&hub, "alice");
    a.close().await;
    let err = a.create(CanvasObject::new(ShapeKind::Star, 0.0, 0.0)).await.unwrap_err();
    assert_eq!(err, SessionClosed);
}

#[tokio::test]
async fn close_flushes_queued_writes() {
    let hub = MemoryHub::default();
    let (a, _) = open(&hub, "alice");
    a.create(CanvasObject::new(ShapeKind::Hexagon, 0.0, 0.0).with_id("h")).await.unwrap();
    a.close().await;
    assert_eq!(hub.records(BOARD).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connection_lost_surfaces_only_after_grace() {
    let hub = MemoryHub::default();
    let (a, link) = open(&hub, "alice");
    let mut indicator = a.indicator();

    link.set_status(ConnectionStatus::Disconnected);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(*indicator.borrow_and_update(), Indicator::Hidden);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(*indicator.borrow_and_update(), Indicator::ConnectionLost);

    link.set_status(ConnectionStatus::Connected);
    wait_for(&mut indicator, |i| *i == Indicator::BackOnline).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(*indicator.borrow(), Indicator::Hidden);
}

#[tokio::test]
async fn link_loss_clears_peer_cursors() {
    let hub = MemoryHub::default();
    let (a, a_link) = open(&hub, "alice");
    let (b, _) = open(&hub, "bob");
    let mut a_roster = a.roster();
    wait_for(&mut a_roster, |r| r.len() == 1).await;

    b.cursor(Some(Point::new(3.0, 4.0)));
    wait_for(&mut a_roster, |r| r.first().and_then(|e| e.cursor) == Some(Point::new(3.0, 4.0))).await;

    a_link.set_status(ConnectionStatus::Disconnected);
    wait_for(&mut a_roster, |r| r.is_empty()).await;

    a_link.set_status(ConnectionStatus::Connected);
    let roster = wait_for(&mut a_roster, |r| r.len() == 1).await;
    assert_eq!(roster[0].participant_id, "bob");
    assert_eq!(roster[0].cursor, None);
}

#[tokio::test]
async fn first_connect_loads_without_banners() {
    let hub = MemoryHub::default();
    let (seeder, _) = open(&hub, "seeder");
    seeder.create(CanvasObject::new(ShapeKind::Ellipse, 0.0, 0.0).with_id("e1")).await.unwrap();
    seeder.close().await;

    let transport = Arc::new(hub.connect());
    transport.set_status(ConnectionStatus::Reconnecting);
    let (a, _task) = BoardSession::spawn(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(SystemClock::new()),
        SyncConfig::default(),
        BOARD,
        Participant::new("alice", "ALICE"),
    );
    let mut indicator = a.indicator();
    assert_eq!(*indicator.borrow_and_update(), Indicator::Hidden);

    transport.set_status(ConnectionStatus::Connected);
    let mut view = a.snapshot();
    wait_for(&mut view, |s| has(s, "e1")).await;
    assert!(!indicator.has_changed().unwrap());
    assert_eq!(*indicator.borrow(), Indicator::Hidden);
}
