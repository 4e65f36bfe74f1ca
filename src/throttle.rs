//! Trailing-edge rate limiter.
//!
//! The first call in a window goes out immediately. Calls inside the window
//! overwrite a single pending slot, and exactly one trailing call carrying the
//! latest arguments fires at the window boundary. The limiter never sleeps:
//! callers pass `now`, and poll `flush` once `deadline` has passed.

#[cfg(test)]
#[path = "throttle_test.rs"]
mod tests;

use std::time::Duration;

use tokio::time::Instant;

pub struct Throttle<T> {
    interval: Duration,
    last_fire: Option<Instant>,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Throttle<T> {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_fire: None, pending: None, deadline: None }
    }

    /// Offer `args`. Returns them back if they should be sent right now;
    /// otherwise they become the pending trailing call.
    pub fn call(&mut self, args: T, now: Instant) -> Option<T> {
        let window_open = self
            .last_fire
            .is_none_or(|at| now.saturating_duration_since(at) >= self.interval);
        if window_open {
            // Newer arguments supersede anything still pending.
            self.pending = None;
            self.deadline = None;
            self.last_fire = Some(now);
            return Some(args);
        }
        self.pending = Some(args);
        if self.deadline.is_none() {
            self.deadline = self.last_fire.and_then(|at| at.checked_add(self.interval));
        }
        None
    }

    /// When the pending trailing call is due, if there is one.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Emit the trailing call if its deadline has passed.
    pub fn flush(&mut self, now: Instant) -> Option<T> {
        if !self.deadline.is_some_and(|at| now >= at) {
            return None;
        }
        self.deadline = None;
        self.last_fire = Some(now);
        self.pending.take()
    }
}

/// A `Throttle` bound to the callback it rate-limits.
pub struct Throttled<T, F>
where
    F: FnMut(T),
{
    throttle: Throttle<T>,
    callback: F,
}

impl<T, F> Throttled<T, F>
where
    F: FnMut(T),
{
    pub fn new(interval: Duration, callback: F) -> Self {
        Self { throttle: Throttle::new(interval), callback }
    }

    pub fn call(&mut self, args: T, now: Instant) {
        if let Some(args) = self.throttle.call(args, now) {
            (self.callback)(args);
        }
    }

    pub fn flush(&mut self, now: Instant) {
        if let Some(args) = self.throttle.flush(now) {
            (self.callback)(args);
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.throttle.deadline()
    }
}
