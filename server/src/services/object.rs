//! Object service: board snapshots and LWW-guarded durable writes.
//!
//! DESIGN
//! ======
//! The relay never interprets object attributes. A persist either changes the
//! stored row or it does not; only a write that changed something yields a
//! `SyncMessage` for the change stream, so stale writes stay invisible to
//! peers.

#[cfg(test)]
#[path = "object_test.rs"]
mod tests;

use boardsync::frame::ErrorCode;
use boardsync::{PersistOp, PersistedRecord, SyncMessage};
use tracing::debug;

use crate::state::AppState;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("record belongs to board {record}, not {board}")]
    BoardMismatch { board: String, record: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for ObjectError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::BoardMismatch { .. } => "E_BOARD_MISMATCH",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::BoardMismatch { .. } => false,
            Self::Store(e) => e.retryable(),
        }
    }
}

/// Full snapshot of `board_id`.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn list_objects(state: &AppState, board_id: &str) -> Result<Vec<PersistedRecord>, ObjectError> {
    Ok(state.store.list(board_id).await?)
}

/// Apply `op` to `board_id`. Returns the change-stream message when the
/// write took effect.
///
/// # Errors
///
/// Returns an error if the record names another board or the store fails.
pub async fn persist(state: &AppState, board_id: &str, op: PersistOp) -> Result<Option<SyncMessage>, ObjectError> {
    let applied = match &op {
        PersistOp::Create(record) | PersistOp::Update(record) => {
            if record.board_id != board_id {
                return Err(ObjectError::BoardMismatch {
                    board: board_id.to_owned(),
                    record: record.board_id.clone(),
                });
            }
            state.store.upsert(record).await?
        }
        PersistOp::Delete { id } => state.store.delete(board_id, id).await?,
    };

    if !applied {
        debug!(%board_id, object_id = %op.object_id(), op = op.label(), "persist: no-op");
        return Ok(None);
    }
    Ok(Some(op.to_message()))
}
