//! Connection lifecycle state owned by the supervisor.
//!
//! All transitions go through the methods below; the supervisor's dispatch
//! loop is the only caller, so the state is never touched from two places.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Stable,
}

/// Snapshot of the supervisor state published to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorHealth {
    pub phase: ConnectionPhase,
    pub attempt_count: u32,
    pub disconnect_count: u32,
    pub last_stable_at: Option<DateTime<Utc>>,
    pub is_reconnecting: bool,
    pub episode: u64,
}

/// Result of accepting a disconnect signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    pub was_stable: bool,
    pub disconnect_count: u32,
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    phase: ConnectionPhase,
    attempt_count: u32,
    disconnect_count: u32,
    last_stable_at: Option<DateTime<Utc>>,
    is_reconnecting: bool,
    /// Incremented on every successful handshake. Timers and probes carry
    /// the episode they were started for so late signals can be told apart.
    episode: u64,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            attempt_count: 0,
            disconnect_count: 0,
            last_stable_at: None,
            is_reconnecting: false,
            episode: 0,
        }
    }

    pub fn begin_connect(&mut self) {
        self.phase = ConnectionPhase::Connecting;
    }

    /// Handshake succeeded. Returns the new episode number.
    pub fn on_connected(&mut self) -> u64 {
        self.phase = ConnectionPhase::Connected;
        self.attempt_count = 0;
        self.is_reconnecting = false;
        self.episode += 1;
        self.episode
    }

    /// Handshake failed. Returns the consecutive attempt count.
    pub fn on_connect_failed(&mut self) -> u32 {
        self.phase = ConnectionPhase::Disconnected;
        self.attempt_count += 1;
        self.attempt_count
    }

    /// The stability window of `episode` elapsed without errors.
    ///
    /// Returns false when the signal belongs to an earlier connection.
    pub fn on_stable(&mut self, episode: u64, now: DateTime<Utc>) -> bool {
        if episode != self.episode || self.phase != ConnectionPhase::Connected {
            return false;
        }
        self.phase = ConnectionPhase::Stable;
        self.disconnect_count = 0;
        self.last_stable_at = Some(now);
        true
    }

    /// Accept a disconnect signal for `episode`, once.
    ///
    /// Signals arriving while a reconnection is already underway, or for an
    /// episode that is no longer live, are dropped and yield `None`.
    pub fn begin_disconnect(&mut self, episode: u64) -> Option<Disconnect> {
        let live = matches!(
            self.phase,
            ConnectionPhase::Connected | ConnectionPhase::Stable
        );
        if self.is_reconnecting || episode != self.episode || !live {
            return None;
        }

        let was_stable = self.phase == ConnectionPhase::Stable;
        self.disconnect_count = if was_stable {
            1
        } else {
            self.disconnect_count + 1
        };
        self.is_reconnecting = true;
        self.phase = ConnectionPhase::Disconnected;

        Some(Disconnect {
            was_stable,
            disconnect_count: self.disconnect_count,
        })
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn is_reconnecting(&self) -> bool {
        self.is_reconnecting
    }

    pub fn health(&self) -> SupervisorHealth {
        SupervisorHealth {
            phase: self.phase,
            attempt_count: self.attempt_count,
            disconnect_count: self.disconnect_count,
            last_stable_at: self.last_stable_at,
            is_reconnecting: self.is_reconnecting,
            episode: self.episode,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
