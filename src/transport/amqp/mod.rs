//! Resilient AMQP session management
//!
//! This module separates pure policy from I/O so that the reconnection and
//! replay rules can be tested without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Pure state machines and backoff arithmetic
//! - [`health_monitor`] - Pure reconnection decisions and health metrics
//! - [`declare`] - Application intent: declarations, subscriptions, queued publishes
//! - [`message_handler`] - Delivery handlers and per-subscription delivery loops
//! - [`session`] - One handshake-complete connection instance
//! - [`client`] - The supervisor that owns the intent and reconnects
//!
//! # Usage
//!
//! ```rust,no_run
//! use amqp_supervisor::transport::amqp::{ConnectionSupervisor, HandlerResult};
//! use amqp_supervisor::transport::lapin::LapinConnector;
//! use amqp_supervisor::transport::Delivery;
//! use amqp_supervisor::SupervisorConfig;
//!
//! async fn on_order(delivery: Delivery) -> HandlerResult {
//!     println!("order: {:?}", delivery.payload);
//!     Ok(())
//! }
//!
//! # tokio_test::block_on(async {
//! let mut supervisor = ConnectionSupervisor::new(SupervisorConfig::default(), LapinConnector)?;
//!
//! // Both calls are accepted before any connection exists
//! supervisor.subscribe("orders", on_order)?;
//! let published = supervisor.send("orders", "first order")?;
//!
//! supervisor.connect()?;
//! supervisor.first_connected().await;
//! published.await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod declare;
pub mod health_monitor;
pub mod message_handler;
pub mod session;

// Re-export public types for convenience
pub use client::ConnectionSupervisor;
pub use connection::{BackoffStrategy, ConnectionState, ReconnectConfig, SessionState};
pub use declare::{
    ExchangeSpec, OutboundMessage, PublishHandle, PublishOptions, QueueSpec, SubscribeOptions,
    Subscription,
};
pub use health_monitor::{
    ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision,
};
pub use message_handler::{DeliveryHandler, HandlerError, HandlerResult};
pub use session::Session;
