//! Frame: the envelope every relay message travels in.
//!
//! ARCHITECTURE
//! ============
//! The WebSocket transport and the relay server speak JSON frames. A client
//! request is answered by `done` or `error` frames whose `parent_id` names the
//! request. Server pushes (peer broadcasts, change-stream events, roster syncs)
//! are `item` frames with no parent.
//!
//! DESIGN
//! ======
//! - Flat data: payload is always a string-keyed map.
//! - The relay routes on `syscall` prefix ("board:", "object:", "presence:")
//!   and only looks inside `data` for the fields a syscall names.

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// SYSCALLS
// =============================================================================

/// Server → client on upgrade. Carries `client_id`.
pub const SESSION_CONNECTED: &str = "session:connected";
pub const BOARD_JOIN: &str = "board:join";
pub const BOARD_PART: &str = "board:part";
/// Full board snapshot, answered with `objects`.
pub const OBJECT_LIST: &str = "object:list";
/// Durable write: `op` plus `object` or `id`.
pub const OBJECT_PERSIST: &str = "object:persist";
/// Peer fan-out of a sync message under `message`.
pub const OBJECT_BROADCAST: &str = "object:broadcast";
/// Server push of a committed write under `message`.
pub const CHANGE_STREAM: &str = "change:stream";
pub const PRESENCE_TRACK: &str = "presence:track";
pub const PRESENCE_UNTRACK: &str = "presence:untrack";
/// Server push of the full roster under `roster`.
pub const PRESENCE_SYNC: &str = "presence:sync";
pub const PRESENCE_BROADCAST: &str = "presence:broadcast";

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

pub const FRAME_MESSAGE: &str = "message";
pub const FRAME_CODE: &str = "code";
pub const FRAME_RETRYABLE: &str = "retryable";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload.
pub type Data = HashMap<String, serde_json::Value>;

/// Lifecycle position of a frame.
///
/// Requests end in exactly one `done` or `error`. `item` is reserved for
/// unsolicited server pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Request,
    Item,
    Done,
    Error,
}

impl Status {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    pub syscall: String,
    pub status: Status,
    #[serde(default)]
    pub data: Data,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

fn now_ms() -> i64 {
    let Ok(dur) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    pub fn request(syscall: impl Into<String>, data: Data) -> Self {
        Self::new(syscall, Status::Request, data)
    }

    /// An unsolicited server push.
    pub fn push(syscall: impl Into<String>, data: Data) -> Self {
        Self::new(syscall, Status::Item, data)
    }

    fn new(syscall: impl Into<String>, status: Status, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            board_id: None,
            from: None,
            syscall: syscall.into(),
            status,
            data,
        }
    }

    #[must_use]
    pub fn done(&self) -> Self {
        self.reply(Status::Done, Data::new())
    }

    #[must_use]
    pub fn done_with(&self, data: Data) -> Self {
        self.reply(Status::Done, data)
    }

    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(message.into()));
        self.reply(Status::Error, data)
    }

    /// Structured error response from a typed error.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(FRAME_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        self.reply(Status::Error, data)
    }

    /// Inherits `parent_id`, `board_id`, and `syscall`.
    fn reply(&self, status: Status, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            board_id: self.board_id.clone(),
            from: None,
            syscall: self.syscall.clone(),
            status,
            data,
        }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_board_id(mut self, board_id: impl Into<String>) -> Self {
        self.board_id = Some(board_id.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// ACCESSORS
// =============================================================================

impl Frame {
    /// Everything before the first ':'.
    #[must_use]
    pub fn prefix(&self) -> &str {
        let Some((prefix, _)) = self.syscall.split_once(':') else {
            return &self.syscall;
        };
        prefix
    }

    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }

    /// The error message of an error frame.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.data_str(FRAME_MESSAGE)
    }
}
