//! Connection lifecycle state and reconnect backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ReconnectConfig;

/// Socket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket, or the last one closed.
    #[default]
    Disconnected,
    /// Socket requested, handshake not finished.
    Connecting,
    /// Socket open and usable.
    Connected,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Exponential backoff for reconnect attempts.
///
/// Delay for attempt `n` is `min(max_delay_ms, base_delay_ms * 2^n)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            attempts: 0,
            base_delay_ms,
            max_delay_ms,
        }
    }

    #[must_use]
    pub const fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay_ms, config.max_delay_ms)
    }

    /// Attempts since the last successful open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count one more attempt and return the delay before it.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.delay_for(self.attempts)
    }

    /// Delay for a given attempt number, without touching the counter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Called on successful open.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
