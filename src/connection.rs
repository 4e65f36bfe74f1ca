//! Connection status tracking and the user-facing indicator derived from it.
//!
//! The transport reports a raw `ConnectionStatus`; `ConnectionMonitor` turns
//! that into what the board should show. It owns two timers, the disconnect
//! grace period and the "back online" flash, both expressed as deadlines the
//! caller polls with `on_tick`. Nothing here sleeps, so tests drive it with
//! explicit instants.

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

use crate::config::SyncConfig;

/// Link status as reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionStatus {
    #[must_use]
    pub fn is_degraded(self) -> bool {
        !matches!(self, Self::Connected)
    }
}

/// What the connection banner currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    Hidden,
    Reconnecting,
    /// Transient confirmation after recovering from a degraded state.
    BackOnline,
    /// Shown once a disconnect has outlasted the grace period.
    ConnectionLost,
}

pub struct ConnectionMonitor {
    status: ConnectionStatus,
    indicator: Indicator,
    /// False until the first `Connected`; the initial attempt is not a recovery.
    has_connected: bool,
    lost_at: Option<Instant>,
    clear_at: Option<Instant>,
    disconnect_grace: Duration,
    back_online: Duration,
}

impl ConnectionMonitor {
    /// Start from the transport's current status. The initial status is not a
    /// transition, and a link that has never connected shows no "reconnecting"
    /// banner while it makes its first attempt.
    #[must_use]
    pub fn new(initial: ConnectionStatus, config: &SyncConfig, now: Instant) -> Self {
        let mut monitor = Self {
            status: initial,
            indicator: Indicator::Hidden,
            has_connected: initial == ConnectionStatus::Connected,
            lost_at: None,
            clear_at: None,
            disconnect_grace: config.disconnect_grace,
            back_online: config.back_online,
        };
        if initial == ConnectionStatus::Disconnected {
            monitor.lost_at = now.checked_add(monitor.disconnect_grace);
        }
        monitor
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    #[must_use]
    pub fn indicator(&self) -> Indicator {
        self.indicator
    }

    /// True while the "back online" confirmation is showing.
    #[must_use]
    pub fn recently_reconnected(&self) -> bool {
        self.indicator == Indicator::BackOnline
    }

    /// Earliest instant at which `on_tick` would change the indicator.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.lost_at, self.clear_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Feed a status report. Returns true when the caller must run a full
    /// load: on the first connect and on every recovery after it.
    pub fn on_status(&mut self, status: ConnectionStatus, now: Instant) -> bool {
        if status == self.status {
            return false;
        }
        let previous = self.status;
        self.status = status;
        self.lost_at = None;
        self.clear_at = None;

        match status {
            ConnectionStatus::Reconnecting => {
                self.indicator = if self.has_connected { Indicator::Reconnecting } else { Indicator::Hidden };
                info!("connection: reconnecting");
                false
            }
            ConnectionStatus::Disconnected => {
                self.indicator = Indicator::Hidden;
                self.lost_at = now.checked_add(self.disconnect_grace);
                info!("connection: disconnected");
                false
            }
            ConnectionStatus::Connected if !self.has_connected => {
                self.has_connected = true;
                self.indicator = Indicator::Hidden;
                info!(from = ?previous, "connection: connected");
                true
            }
            ConnectionStatus::Connected => {
                self.indicator = Indicator::BackOnline;
                self.clear_at = now.checked_add(self.back_online);
                info!(from = ?previous, "connection: back online");
                true
            }
        }
    }

    /// Fire any timer whose deadline has passed.
    pub fn on_tick(&mut self, now: Instant) {
        if self.lost_at.is_some_and(|at| now >= at) {
            self.lost_at = None;
            self.indicator = Indicator::ConnectionLost;
            info!("connection: lost");
        }
        if self.clear_at.is_some_and(|at| now >= at) {
            self.clear_at = None;
            self.indicator = Indicator::Hidden;
        }
    }
}
