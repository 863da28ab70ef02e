//! Broker-protocol boundary
//!
//! The supervisor never speaks AMQP frames itself. Everything it needs from
//! the protocol library is expressed by the traits in this module, which
//! enables dependency injection: [`lapin::LapinConnector`] talks to a real
//! broker and [`crate::testing::MockConnector`] records directives in memory.

use crate::config::{ConnectionConfig, Credentials};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod amqp;
pub mod lapin;

/// Boxed error produced by the underlying protocol library
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Opens raw transports to the broker
///
/// One call produces one connection instance; the supervisor calls it again
/// after every disconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a transport to the configured broker (no authentication yet)
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One live transport to the broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Submit login credentials
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), BrokerError>;

    /// Open the control channel
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Resolves with a reason once the transport is lost
    async fn closed(&self) -> String;

    /// Close the transport; best effort
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Directives issued on an open channel
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Cap the number of unacknowledged deliveries
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), BrokerError>;

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Start a consumer and return its delivery stream
    async fn start_consuming(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    async fn publish(&self, request: &PublishRequest) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;
}

/// Asynchronous "next delivered message" primitive for one consumer tag
#[async_trait]
pub trait DeliveryStream: Send {
    /// `None` means the broker closed the consumer
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;
}

/// Broker-side exchange types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl ExchangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Custom(kind) => kind.as_str(),
        }
    }
}

impl From<&str> for ExchangeKind {
    fn from(kind: &str) -> Self {
        match kind {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved exchange-declare arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Fully resolved queue-declare arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Whether the broker persists a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// AMQP `delivery-mode` property value
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Acknowledgement mode of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Broker considers the message delivered once sent (`no_ack`)
    #[default]
    Auto,
    /// Client acks after the handler completes
    Manual,
}

impl AckMode {
    pub fn no_ack(self) -> bool {
        matches!(self, AckMode::Auto)
    }
}

/// Arguments of a basic.publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub delivery_mode: DeliveryMode,
    pub immediate: bool,
    pub mandatory: bool,
}

/// A message delivered to one of our consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Bytes,
}

/// Protocol directives, used to label failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    SetQos,
    DeclareExchange,
    DeclareQueue,
    BindQueue,
    StartConsuming,
    Publish,
    Ack,
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Directive::SetQos => "basic.qos",
            Directive::DeclareExchange => "exchange.declare",
            Directive::DeclareQueue => "queue.declare",
            Directive::BindQueue => "queue.bind",
            Directive::StartConsuming => "basic.consume",
            Directive::Publish => "basic.publish",
            Directive::Ack => "basic.ack",
        };
        f.write_str(name)
    }
}

/// Errors reported by the broker-protocol library
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Transport connect failed: {0}")]
    ConnectFailed(#[source] BoxError),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(#[source] BoxError),
    #[error("Channel open failed: {0}")]
    ChannelOpenFailed(#[source] BoxError),
    #[error("{directive} failed: {source}")]
    DirectiveFailed {
        directive: Directive,
        #[source]
        source: BoxError,
    },
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
}

impl BrokerError {
    pub fn directive<E>(directive: Directive, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::DirectiveFailed {
            directive,
            source: source.into(),
        }
    }

    /// Whether this error ends the handshake of a session
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            BrokerError::AuthenticationFailed(_) | BrokerError::ChannelOpenFailed(_)
        )
    }
}
