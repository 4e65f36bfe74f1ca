use super::*;
use crate::state::test_helpers;
use boardsync::frame::Data;
use tokio::time::{Duration, timeout};

fn meta(id: &str) -> PresenceMeta {
    PresenceMeta { participant_id: id.into(), display_name: Some(id.to_uppercase()), cursor: None }
}

async fn assert_channel_has_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("channel closed")
}

async fn assert_channel_empty(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

#[tokio::test]
async fn broadcast_sends_to_all_except_excluded_client() {
    let state = test_helpers::test_app_state();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    let (tx_c, mut rx_c) = mpsc::channel(8);
    join_board(&state, "b1", a, tx_a).await;
    join_board(&state, "b1", b, tx_b).await;
    join_board(&state, "b2", c, tx_c).await;

    let frame = Frame::push("object:broadcast", Data::new()).with_board_id("b1");
    broadcast(&state, "b1", &frame, Some(b)).await;

    assert_eq!(assert_channel_has_frame(&mut rx_a).await.syscall, "object:broadcast");
    assert_channel_empty(&mut rx_b).await;
    assert_channel_empty(&mut rx_c).await;
}

#[tokio::test]
async fn track_requires_membership() {
    let state = test_helpers::test_app_state();
    let client = Uuid::new_v4();
    assert!(track(&state, "b1", client, meta("alice")).await.is_none());

    let (tx, _rx) = mpsc::channel(8);
    join_board(&state, "b1", client, tx).await;
    let roster = track(&state, "b1", client, meta("alice")).await.unwrap();
    assert_eq!(roster, vec![meta("alice")]);

    // Re-tracking replaces the entry.
    let mut moved = meta("alice");
    moved.display_name = Some("Al".into());
    let roster = track(&state, "b1", client, moved.clone()).await.unwrap();
    assert_eq!(roster, vec![moved]);
}

#[tokio::test]
async fn part_reports_roster_only_when_tracked() {
    let state = test_helpers::test_app_state();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    for id in [a, b, c] {
        let (tx, _rx) = mpsc::channel(8);
        join_board(&state, "b1", id, tx).await;
    }
    track(&state, "b1", a, meta("alice")).await;
    track(&state, "b1", b, meta("bob")).await;

    assert!(part_board(&state, "b1", c).await.is_none());
    assert_eq!(part_board(&state, "b1", a).await, Some(vec![meta("bob")]));
}

#[tokio::test]
async fn last_part_evicts_room() {
    let state = test_helpers::test_app_state();
    let client = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(8);
    join_board(&state, "b1", client, tx).await;
    track(&state, "b1", client, meta("alice")).await;

    assert!(part_board(&state, "b1", client).await.is_none());
    assert!(state.boards.read().await.is_empty());
}

#[tokio::test]
async fn untrack_keeps_membership() {
    let state = test_helpers::test_app_state();
    let client = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(8);
    join_board(&state, "b1", client, tx).await;
    track(&state, "b1", client, meta("alice")).await;

    assert!(untrack(&state, "b1", client).await.is_empty());
    assert!(state.boards.read().await["b1"].clients.contains_key(&client));
    assert!(untrack(&state, "missing", client).await.is_empty());
}
