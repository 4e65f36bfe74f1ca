//! Grouped undo/redo for externally driven units of work.
//!
//! One unit of work (an agent turn, a multi-select drag) may create, update,
//! and delete several objects. `GroupRecorder` performs those mutations
//! through any `ObjectMutator` and records how to reverse each one; the
//! resulting `UndoGroup` is undone or redone as a single step.
//!
//! Undo replays a group's entries in reverse order applying inverses. Redo
//! replays them forward re-applying the recorded values. Pushing a new group
//! discards the redo stack.

#[cfg(test)]
#[path = "undo_test.rs"]
mod tests;

use std::collections::VecDeque;

use tracing::debug;

use crate::channel::ObjectMutator;
use crate::model::{CanvasObject, ObjectId, ObjectPatch};

/// Pre- and post-mutation values of exactly the fields an update changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub id: ObjectId,
    pub previous: ObjectPatch,
    pub applied: ObjectPatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UndoEntry {
    /// Full created objects.
    Create(Vec<CanvasObject>),
    Update(FieldChange),
    /// Full pre-deletion snapshots.
    Delete(Vec<CanvasObject>),
    BatchUpdate(Vec<FieldChange>),
}

impl UndoEntry {
    fn undo(&self, target: &mut impl ObjectMutator) {
        match self {
            Self::Create(objects) => {
                for obj in objects.iter().rev() {
                    target.delete(&obj.id);
                }
            }
            Self::Update(change) => revert(target, change),
            Self::Delete(objects) => {
                for obj in objects.iter().rev() {
                    target.create(obj.clone());
                }
            }
            Self::BatchUpdate(changes) => {
                for change in changes.iter().rev() {
                    revert(target, change);
                }
            }
        }
    }

    fn redo(&self, target: &mut impl ObjectMutator) {
        match self {
            Self::Create(objects) => {
                for obj in objects {
                    target.create(obj.clone());
                }
            }
            Self::Update(change) => reapply(target, change),
            Self::Delete(objects) => {
                for obj in objects {
                    target.delete(&obj.id);
                }
            }
            Self::BatchUpdate(changes) => {
                for change in changes {
                    reapply(target, change);
                }
            }
        }
    }
}

fn revert(target: &mut impl ObjectMutator, change: &FieldChange) {
    if target.update(&change.id, &change.previous).is_none() {
        debug!(object_id = %change.id, "undo: object no longer exists");
    }
}

fn reapply(target: &mut impl ObjectMutator, change: &FieldChange) {
    if target.update(&change.id, &change.applied).is_none() {
        debug!(object_id = %change.id, "redo: object no longer exists");
    }
}

/// The reversible record of one unit of work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UndoGroup {
    entries: Vec<UndoEntry>,
}

impl UndoGroup {
    #[must_use]
    pub fn entries(&self) -> &[UndoEntry] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// HISTORY
// =============================================================================

pub struct UndoHistory {
    undo: VecDeque<UndoGroup>,
    redo: Vec<UndoGroup>,
    limit: usize,
}

impl UndoHistory {
    /// History retaining at most `limit` groups; the oldest is dropped first.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { undo: VecDeque::new(), redo: Vec::new(), limit: limit.max(1) }
    }

    /// Record a finished group. Empty groups are ignored and leave redo intact.
    pub fn push(&mut self, group: UndoGroup) {
        if group.is_empty() {
            return;
        }
        self.redo.clear();
        self.undo.push_back(group);
        while self.undo.len() > self.limit {
            self.undo.pop_front();
        }
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    /// Reverse the most recent group. Returns false if there was none.
    pub fn undo(&mut self, target: &mut impl ObjectMutator) -> bool {
        let Some(group) = self.undo.pop_back() else {
            return false;
        };
        for entry in group.entries.iter().rev() {
            entry.undo(target);
        }
        self.redo.push(group);
        true
    }

    /// Re-apply the most recently undone group. Returns false if there was none.
    pub fn redo(&mut self, target: &mut impl ObjectMutator) -> bool {
        let Some(group) = self.redo.pop() else {
            return false;
        };
        for entry in &group.entries {
            entry.redo(target);
        }
        self.undo.push_back(group);
        true
    }
}

// =============================================================================
// RECORDER
// =============================================================================

/// Performs mutations on `target` and records their inverses.
pub struct GroupRecorder<'a, M: ObjectMutator> {
    target: &'a mut M,
    entries: Vec<UndoEntry>,
}

impl<'a, M: ObjectMutator> GroupRecorder<'a, M> {
    pub fn new(target: &'a mut M) -> Self {
        Self { target, entries: Vec::new() }
    }

    pub fn create(&mut self, object: CanvasObject) -> CanvasObject {
        let created = self.target.create(object);
        self.entries.push(UndoEntry::Create(vec![created.clone()]));
        created
    }

    /// Apply `patch` to `id`. Records only the fields that actually change;
    /// an update that changes nothing is neither applied nor recorded.
    pub fn update(&mut self, id: &str, patch: &ObjectPatch) -> Option<CanvasObject> {
        let change = self.apply_change(id, patch)?;
        self.entries.push(UndoEntry::Update(change));
        self.target.get(id).cloned()
    }

    /// Apply several updates as one `BatchUpdate` entry.
    pub fn update_many<'p>(&mut self, updates: impl IntoIterator<Item = (&'p str, &'p ObjectPatch)>) -> usize {
        let changes: Vec<FieldChange> = updates
            .into_iter()
            .filter_map(|(id, patch)| self.apply_change(id, patch))
            .collect();
        let applied = changes.len();
        if !changes.is_empty() {
            self.entries.push(UndoEntry::BatchUpdate(changes));
        }
        applied
    }

    pub fn delete(&mut self, id: &str) -> Option<CanvasObject> {
        let snapshot = self.target.get(id)?.clone();
        self.target.delete(id);
        self.entries.push(UndoEntry::Delete(vec![snapshot.clone()]));
        Some(snapshot)
    }

    /// The mutator being recorded against.
    #[must_use]
    pub fn target(&self) -> &M {
        self.target
    }

    #[must_use]
    pub fn finish(self) -> UndoGroup {
        UndoGroup { entries: self.entries }
    }

    fn apply_change(&mut self, id: &str, patch: &ObjectPatch) -> Option<FieldChange> {
        let before = self.target.get(id)?;
        let applied = patch.changes_for(before);
        if applied.is_empty() {
            return None;
        }
        let previous = applied.capture(before);
        self.target.update(id, &applied)?;
        Some(FieldChange { id: id.to_owned(), previous, applied })
    }
}
