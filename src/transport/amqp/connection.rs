//! Pure connection state and reconnection policy
//!
//! This module contains the supervisor and session state machines and the
//! backoff arithmetic. Nothing here performs I/O.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supervisor-level connection state, observable through a watch channel
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Created but `connect()` has not been called
    Idle,
    /// Transport or handshake in progress
    Connecting,
    /// A session is ready; sends and subscriptions flow through it
    Ready,
    /// Disconnected with reason
    Disconnected(String),
    /// Waiting to reconnect (attempt count)
    Reconnecting(u32),
    /// Max reconnection attempts exceeded, or shut down
    PermanentlyDisconnected(String),
}

/// Lifecycle of one session; `Closed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    ChannelOpening,
    Ready,
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Authenticating) => true,
            (Authenticating, ChannelOpening) => true,
            (ChannelOpening, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::ChannelOpening => "channel_opening",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Delay curve between reconnection attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Walk an explicit ladder of delays, then stay at `sustained_ms`
    Pattern {
        delays_ms: Vec<u64>,
        sustained_ms: u64,
    },
    /// `initial_ms * factor^(attempt-1)`, capped at `max_ms`
    Exponential {
        initial_ms: u64,
        factor: f64,
        max_ms: u64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Pattern {
            delays_ms: vec![25, 50, 100, 250],
            sustained_ms: 250,
        }
    }
}

impl BackoffStrategy {
    /// Curve of a classic reconnecting client factory: 1s, growing by e, capped at an hour
    pub fn classic_exponential() -> Self {
        BackoffStrategy::Exponential {
            initial_ms: 1000,
            factor: std::f64::consts::E,
            max_ms: 3_600_000,
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    pub backoff: BackoffStrategy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl ReconnectConfig {
    /// Sum of all delays up to `max_attempts`; None for unlimited retries
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .fold(0u64, u64::saturating_add)
        })
    }

    /// Delay in milliseconds before the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        match &self.backoff {
            BackoffStrategy::Pattern {
                delays_ms,
                sustained_ms,
            } => {
                let index = attempt.saturating_sub(1) as usize;
                delays_ms.get(index).copied().unwrap_or(*sustained_ms)
            }
            BackoffStrategy::Exponential {
                initial_ms,
                factor,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let delay = *initial_ms as f64 * factor.powi(exponent);
                if delay.is_finite() && delay < *max_ms as f64 {
                    delay as u64
                } else {
                    *max_ms
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        match &self.backoff {
            BackoffStrategy::Pattern { sustained_ms, .. } if *sustained_ms == 0 => {
                Err("sustained_ms must be greater than 0".to_string())
            }
            BackoffStrategy::Exponential {
                initial_ms,
                factor,
                max_ms,
            } => {
                if *initial_ms == 0 || *max_ms == 0 {
                    Err("initial_ms and max_ms must be greater than 0".to_string())
                } else if factor.is_nan() || *factor < 1.0 {
                    Err("factor must be at least 1.0".to_string())
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}
