//! Last-write-wins decision.
//!
//! An incoming object replaces the local one only when its `last_modified` is
//! strictly greater. Ties keep the local value, which makes re-delivery of the
//! same record a no-op and keeps two peers with equal stamps from flickering.

use super::CanvasObject;

/// Whether a merge altered the local map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Changed,
    Unchanged,
}

impl MergeOutcome {
    #[must_use]
    pub fn is_changed(self) -> bool {
        matches!(self, Self::Changed)
    }
}

/// True when `remote` should overwrite `local`.
#[must_use]
pub fn should_replace(local: Option<&CanvasObject>, remote: &CanvasObject) -> bool {
    match local {
        None => true,
        Some(existing) => remote.last_modified > existing.last_modified,
    }
}
