use std::sync::Arc;

use super::*;
use crate::channel::ChannelManager;
use crate::clock::{Clock, ManualClock};
use crate::model::ShapeKind;
use crate::transport::memory::MemoryHub;

fn manager(hub: &MemoryHub) -> (ChannelManager, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at(1_000));
    let mgr = ChannelManager::new(
        Arc::new(hub.connect()),
        Arc::clone(&clock) as Arc<dyn Clock>,
        "board-1",
        None,
    );
    (mgr, clock)
}

fn rect(id: &str, x: f64) -> CanvasObject {
    CanvasObject::new(ShapeKind::Rectangle, x, 0.0).with_id(id)
}

/// Compare ignoring `last_modified`, which every replay re-stamps.
fn same_fields(a: &CanvasObject, b: &CanvasObject) -> bool {
    let mut b = b.clone();
    b.last_modified = a.last_modified.clone();
    *a == b
}

#[tokio::test]
async fn create_undo_redo_round_trip() {
    let hub = MemoryHub::new(16);
    let (mut mgr, clock) = manager(&hub);
    let mut history = UndoHistory::new(50);

    let mut rec = GroupRecorder::new(&mut mgr);
    let created = rec.create(rect("n1", 5.0).with_text("note"));
    history.push(rec.finish());

    assert!(history.undo(&mut mgr));
    assert!(!mgr.store().contains("n1"));

    clock.advance(10);
    assert!(history.redo(&mut mgr));
    let restored = mgr.store().get("n1").unwrap();
    assert!(same_fields(&created, restored));
}

#[tokio::test]
async fn update_undo_restores_previous_value() {
    let hub = MemoryHub::new(16);
    let (mut mgr, clock) = manager(&hub);
    mgr.create(rect("a", 10.0));
    let mut history = UndoHistory::new(50);

    clock.advance(1);
    let mut rec = GroupRecorder::new(&mut mgr);
    rec.update("a", &ObjectPatch { x: Some(50.0), ..ObjectPatch::default() });
    history.push(rec.finish());
    assert_eq!(mgr.store().get("a").unwrap().x, 50.0);

    clock.advance(1);
    history.undo(&mut mgr);
    assert_eq!(mgr.store().get("a").unwrap().x, 10.0);

    clock.advance(1);
    history.redo(&mut mgr);
    assert_eq!(mgr.store().get("a").unwrap().x, 50.0);
}

#[tokio::test]
async fn update_records_only_changed_fields() {
    let hub = MemoryHub::new(16);
    let (mut mgr, _clock) = manager(&hub);
    mgr.create(rect("a", 10.0));

    let mut rec = GroupRecorder::new(&mut mgr);
    let patch = ObjectPatch { x: Some(10.0), y: Some(7.0), ..ObjectPatch::default() };
    rec.update("a", &patch);
    let group = rec.finish();

    let [UndoEntry::Update(change)] = group.entries() else {
        panic!("expected one update entry");
    };
    assert_eq!(change.applied, ObjectPatch { y: Some(7.0), ..ObjectPatch::default() });
    assert_eq!(change.previous, ObjectPatch { y: Some(0.0), ..ObjectPatch::default() });
}

#[tokio::test]
async fn delete_undo_restores_snapshot() {
    let hub = MemoryHub::new(16);
    let (mut mgr, _clock) = manager(&hub);
    let original = mgr.create(rect("d", 3.0).with_text("keep me"));
    let mut history = UndoHistory::new(50);

    let mut rec = GroupRecorder::new(&mut mgr);
    assert!(rec.delete("d").is_some());
    assert!(rec.delete("never-existed").is_none());
    history.push(rec.finish());
    assert!(!mgr.store().contains("d"));

    history.undo(&mut mgr);
    assert!(same_fields(&original, mgr.store().get("d").unwrap()));
    history.redo(&mut mgr);
    assert!(!mgr.store().contains("d"));
}

#[tokio::test]
async fn mixed_group_undoes_in_reverse_order() {
    let hub = MemoryHub::new(16);
    let (mut mgr, _clock) = manager(&hub);
    mgr.create(rect("existing", 0.0));
    let mut history = UndoHistory::new(50);

    // One agent turn: create, move the new object, delete the old one.
    let mut rec = GroupRecorder::new(&mut mgr);
    rec.create(rect("fresh", 1.0));
    rec.update("fresh", &ObjectPatch::position(9.0, 9.0));
    rec.delete("existing");
    history.push(rec.finish());

    history.undo(&mut mgr);
    assert!(mgr.store().contains("existing"));
    assert!(!mgr.store().contains("fresh"));

    history.redo(&mut mgr);
    assert!(!mgr.store().contains("existing"));
    assert_eq!(mgr.store().get("fresh").unwrap().x, 9.0);
}

#[tokio::test]
async fn batch_update_is_one_entry() {
    let hub = MemoryHub::new(16);
    let (mut mgr, _clock) = manager(&hub);
    mgr.create(rect("a", 0.0));
    mgr.create(rect("b", 0.0));
    let mut history = UndoHistory::new(50);

    let move_a = ObjectPatch::position(1.0, 1.0);
    let move_b = ObjectPatch::position(2.0, 2.0);
    let mut rec = GroupRecorder::new(&mut mgr);
    let applied = rec.update_many([("a", &move_a), ("b", &move_b), ("ghost", &move_a)]);
    assert_eq!(applied, 2);
    let group = rec.finish();
    assert!(matches!(group.entries(), [UndoEntry::BatchUpdate(changes)] if changes.len() == 2));
    history.push(group);

    history.undo(&mut mgr);
    assert_eq!(mgr.store().get("a").unwrap().x, 0.0);
    assert_eq!(mgr.store().get("b").unwrap().x, 0.0);
}

#[tokio::test]
async fn new_group_clears_redo() {
    let hub = MemoryHub::new(16);
    let (mut mgr, _clock) = manager(&hub);
    let mut history = UndoHistory::new(50);

    let mut rec = GroupRecorder::new(&mut mgr);
    rec.create(rect("one", 0.0));
    history.push(rec.finish());
    history.undo(&mut mgr);
    assert!(history.can_redo());

    let mut rec = GroupRecorder::new(&mut mgr);
    rec.create(rect("two", 0.0));
    history.push(rec.finish());
    assert!(!history.can_redo());
    assert!(!history.redo(&mut mgr));
}

#[tokio::test]
async fn empty_group_is_not_recorded() {
    let hub = MemoryHub::new(16);
    let (mut mgr, _clock) = manager(&hub);
    let mut history = UndoHistory::new(50);

    let mut rec = GroupRecorder::new(&mut mgr);
    assert!(rec.update("ghost", &ObjectPatch::position(1.0, 1.0)).is_none());
    history.push(rec.finish());
    assert!(!history.can_undo());
    assert!(!history.undo(&mut mgr));
}

#[tokio::test]
async fn history_is_capped() {
    let hub = MemoryHub::new(16);
    let (mut mgr, _clock) = manager(&hub);
    let mut history = UndoHistory::new(3);

    for i in 0..5 {
        let mut rec = GroupRecorder::new(&mut mgr);
        rec.create(rect(&format!("o{i}"), 0.0));
        history.push(rec.finish());
    }
    assert_eq!(history.undo_len(), 3);
    while history.undo(&mut mgr) {}
    assert!(mgr.store().contains("o0"));
    assert!(mgr.store().contains("o1"));
    assert!(!mgr.store().contains("o2"));
}

#[tokio::test]
async fn undo_of_update_on_vanished_object_is_harmless() {
    let hub = MemoryHub::new(16);
    let (mut mgr, _clock) = manager(&hub);
    mgr.create(rect("a", 0.0));
    let mut history = UndoHistory::new(50);

    let mut rec = GroupRecorder::new(&mut mgr);
    rec.update("a", &ObjectPatch::position(4.0, 4.0));
    history.push(rec.finish());

    mgr.delete("a");
    assert!(history.undo(&mut mgr));
    assert!(!mgr.store().contains("a"));
}
