//! Thread-safe metrics collection
//!
//! Each supervisor owns one [`MetricsCollector`]; sessions and delivery loops
//! hold an `Arc` to it. Counters are atomics so the hot paths never lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Thread-safe metrics collector using atomics
#[derive(Debug)]
pub struct MetricsCollector {
    // Connection lifecycle
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connection_failures: AtomicU64,
    handshake_failures: AtomicU64,
    sessions_ready: AtomicU64,
    connections_lost: AtomicU64,

    // Publishing
    messages_published: AtomicU64,
    publish_failures: AtomicU64,

    // Consuming
    subscriptions_activated: AtomicU64,
    activation_failures: AtomicU64,
    deliveries_received: AtomicU64,
    handler_failures: AtomicU64,
    acks_sent: AtomicU64,

    ready_since: Mutex<Option<Instant>>,
    last_delivery: Mutex<Option<Instant>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            sessions_ready: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            subscriptions_activated: AtomicU64::new(0),
            activation_failures: AtomicU64::new(0),
            deliveries_received: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            ready_since: Mutex::new(None),
            last_delivery: Mutex::new(None),
        }
    }

    // Connection lifecycle
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ready(&self) {
        self.sessions_ready.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        if let Ok(mut ready_since) = self.ready_since.lock() {
            *ready_since = Some(Instant::now());
        }
    }

    /// The transport went away; counts as a loss only if a session had been ready
    pub fn connection_lost(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            self.connections_lost.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut ready_since) = self.ready_since.lock() {
            *ready_since = None;
        }
    }

    // Publishing
    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Consuming
    pub fn subscription_activated(&self) {
        self.subscriptions_activated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn activation_failed(&self) {
        self.activation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_received(&self) {
        self.deliveries_received.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last_delivery) = self.last_delivery.lock() {
            *last_delivery = Some(Instant::now());
        }
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ready_since(&self) -> Option<Instant> {
        self.ready_since.lock().ok().and_then(|guard| *guard)
    }

    pub fn last_delivery(&self) -> Option<Instant> {
        self.last_delivery.lock().ok().and_then(|guard| *guard)
    }

    pub fn connections_lost(&self) -> u64 {
        self.connections_lost.load(Ordering::Relaxed)
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime_seconds = self
            .ready_since()
            .map(|since| since.elapsed().as_secs())
            .unwrap_or(0);

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
                sessions_ready: self.sessions_ready.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                uptime_seconds,
            },
            publishing: PublishMetrics {
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
            },
            consuming: ConsumeMetrics {
                subscriptions_activated: self.subscriptions_activated.load(Ordering::Relaxed),
                activation_failures: self.activation_failures.load(Ordering::Relaxed),
                deliveries_received: self.deliveries_received.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                acks_sent: self.acks_sent.load(Ordering::Relaxed),
            },
            timestamp: Utc::now(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub publishing: PublishMetrics,
    pub consuming: ConsumeMetrics,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub handshake_failures: u64,
    pub sessions_ready: u64,
    pub connections_lost: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub messages_published: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumeMetrics {
    pub subscriptions_activated: u64,
    pub activation_failures: u64,
    pub deliveries_received: u64,
    pub handler_failures: u64,
    pub acks_sent: u64,
}
