//! Engine tuning knobs loaded from environment variables.
//!
//! Every value has a default; unset or unparseable variables fall back to it
//! so a misconfigured environment never prevents a board from opening.

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

use std::time::Duration;

const DEFAULT_CURSOR_INTERVAL_MS: u64 = 50;
const DEFAULT_DISCONNECT_GRACE_MS: u64 = 5_000;
const DEFAULT_BACK_ONLINE_MS: u64 = 2_000;
const DEFAULT_UNDO_HISTORY: usize = 50;
const DEFAULT_INBOUND_CAPACITY: usize = 256;
const DEFAULT_PENDING_CURSOR_LIMIT: usize = 128;

/// Timing and capacity settings shared by every component of a board session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Trailing-edge throttle window for outbound cursor broadcasts.
    pub cursor_interval: Duration,
    /// How long a disconnect must last before the "connection lost" banner shows.
    pub disconnect_grace: Duration,
    /// How long the "back online" confirmation stays visible.
    pub back_online: Duration,
    /// Maximum undo groups retained; the oldest group is dropped beyond this.
    pub undo_history: usize,
    /// Bound on each inbound subscription queue. Overflow is dropped.
    pub inbound_capacity: usize,
    /// Maximum cursors buffered for participants not yet in the roster.
    pub pending_cursor_limit: usize,
}

impl SyncConfig {
    /// Load from `BOARDSYNC_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            cursor_interval: Duration::from_millis(env_parse(
                "BOARDSYNC_CURSOR_INTERVAL_MS",
                DEFAULT_CURSOR_INTERVAL_MS,
            )),
            disconnect_grace: Duration::from_millis(env_parse(
                "BOARDSYNC_DISCONNECT_GRACE_MS",
                DEFAULT_DISCONNECT_GRACE_MS,
            )),
            back_online: Duration::from_millis(env_parse("BOARDSYNC_BACK_ONLINE_MS", DEFAULT_BACK_ONLINE_MS)),
            undo_history: env_parse("BOARDSYNC_UNDO_HISTORY", DEFAULT_UNDO_HISTORY),
            inbound_capacity: env_parse("BOARDSYNC_INBOUND_CAPACITY", DEFAULT_INBOUND_CAPACITY).max(1),
            pending_cursor_limit: env_parse("BOARDSYNC_PENDING_CURSOR_LIMIT", DEFAULT_PENDING_CURSOR_LIMIT),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cursor_interval: Duration::from_millis(DEFAULT_CURSOR_INTERVAL_MS),
            disconnect_grace: Duration::from_millis(DEFAULT_DISCONNECT_GRACE_MS),
            back_online: Duration::from_millis(DEFAULT_BACK_ONLINE_MS),
            undo_history: DEFAULT_UNDO_HISTORY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            pending_cursor_limit: DEFAULT_PENDING_CURSOR_LIMIT,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
