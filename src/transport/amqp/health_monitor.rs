//! Pure health monitoring and reconnection logic
//!
//! Decision functions used by the supervisor's reconnection task. They take
//! plain values and return plain values so the reconnection policy can be
//! tested without a runtime.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to attempt another connection after `failed_attempts` consecutive failures
    pub fn should_attempt_reconnection(
        failed_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if failed_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = failed_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Determine next supervisor state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::TransportConnected => ConnectionState::Connecting,
            ConnectionEvent::SessionReady => {
                info!("AMQP session ready");
                ConnectionState::Ready
            }
            ConnectionEvent::ConnectFailed(reason) => {
                warn!("AMQP connection attempt failed: {}", reason);
                ConnectionState::Disconnected(reason)
            }
            ConnectionEvent::HandshakeFailed(reason) => {
                error!("AMQP handshake failed: {}", reason);
                ConnectionState::Disconnected(reason)
            }
            ConnectionEvent::ConnectionLost(reason) => {
                warn!("AMQP connection lost: {}", reason);
                ConnectionState::Disconnected(reason)
            }
            ConnectionEvent::ReconnectionStarted(attempt) => {
                info!("Starting reconnection attempt {}", attempt);
                ConnectionState::Reconnecting(attempt)
            }
            ConnectionEvent::PermanentFailure(reason) => {
                error!("Permanent connection failure: {}", reason);
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Calculate health metrics for the supervisor
    pub fn calculate_health_metrics(
        ready_since: Option<Instant>,
        last_delivery: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();
        let uptime = ready_since.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_delivery: last_delivery.map(|t| now.duration_since(t)),
            reconnect_count,
            is_healthy: uptime.is_some(),
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger supervisor state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    TransportConnected,
    SessionReady,
    ConnectFailed(String),
    HandshakeFailed(String),
    ConnectionLost(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since the current session became ready
    pub uptime: Option<Duration>,
    /// Time since the last delivery on any subscription
    pub time_since_last_delivery: Option<Duration>,
    /// Number of sessions lost after reaching ready
    pub reconnect_count: u32,
    /// A session is currently ready
    pub is_healthy: bool,
}
