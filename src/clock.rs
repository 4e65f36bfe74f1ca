//! Timestamps used as the sole last-write-wins key.
//!
//! DESIGN
//! ======
//! Stamps are fixed-width UTC ISO-8601 strings (`YYYY-MM-DDTHH:MM:SS.mmmZ`),
//! so lexicographic order equals chronological order. Clients are clocked
//! independently and nothing here corrects skew between them: a client with
//! a fast wall clock can win against a genuinely later edit from a peer.
//!
//! `SystemClock` is strictly increasing within one process, so two edits in
//! the same millisecond still compare as distinct writes on every peer.

#[cfg(test)]
#[path = "clock_test.rs"]
mod tests;

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

const STAMP_FORMAT: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

const EPOCH_STAMP: &str = "1970-01-01T00:00:00.000Z";

/// An ISO-8601 `last_modified` stamp. Ordered by string comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Wrap a stamp received from the wire or from storage as-is.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Format milliseconds since the Unix epoch as a fixed-width UTC stamp.
    #[must_use]
    pub fn from_unix_millis(ms: i64) -> Self {
        let nanos = i128::from(ms) * 1_000_000;
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .ok()
            .and_then(|dt| dt.format(STAMP_FORMAT).ok())
            .map_or_else(|| Self::new(EPOCH_STAMP), Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::from_unix_millis(0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Timestamp {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Source of `last_modified` stamps for local mutations.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock, strictly increasing per instance.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_ms: AtomicI64,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_millis(&self) -> i64 {
        let wall = now_ms();
        let mut current = self.last_ms.load(Ordering::Relaxed);
        loop {
            let next = wall.max(current.saturating_add(1));
            match self
                .last_ms
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_unix_millis(self.next_millis())
    }
}

/// Hand-driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn at(ms: i64) -> Self {
        Self { ms: AtomicI64::new(ms) }
    }

    pub fn set(&self, ms: i64) {
        self.ms.store(ms, Ordering::Relaxed);
    }

    pub fn advance(&self, ms: i64) {
        self.ms.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_unix_millis(self.ms.load(Ordering::Relaxed))
    }
}

fn now_ms() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(0)
}
