//! Application intent: partial declarations, subscriptions, queued publishes
//!
//! Exchange and queue specs carry `Option` fields so that a caller's explicit
//! `false` is never overwritten by a default; only unset fields are filled
//! when the spec is resolved into a declaration.

use super::message_handler::DeliveryHandler;
use crate::error::PublishError;
use crate::transport::{
    AckMode, DeliveryMode, ExchangeDeclaration, ExchangeKind, PublishRequest, QueueDeclaration,
};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub const DEFAULT_EXCHANGE_KIND: ExchangeKind = ExchangeKind::Direct;
pub const DEFAULT_EXCHANGE_DURABLE: bool = true;
pub const DEFAULT_EXCHANGE_AUTO_DELETE: bool = false;
pub const DEFAULT_QUEUE_DURABLE: bool = true;
pub const DEFAULT_QUEUE_EXCLUSIVE: bool = false;
pub const DEFAULT_QUEUE_AUTO_DELETE: bool = false;

/// Exchange identity plus optional declaration overrides
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: Option<ExchangeKind>,
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: impl Into<ExchangeKind>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    /// Fill unset fields with defaults (direct, durable, not auto-deleted)
    pub fn resolve(&self) -> ExchangeDeclaration {
        ExchangeDeclaration {
            name: self.name.clone(),
            kind: self.kind.clone().unwrap_or(DEFAULT_EXCHANGE_KIND),
            durable: self.durable.unwrap_or(DEFAULT_EXCHANGE_DURABLE),
            auto_delete: self.auto_delete.unwrap_or(DEFAULT_EXCHANGE_AUTO_DELETE),
        }
    }
}

impl From<&str> for ExchangeSpec {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ExchangeSpec {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Queue identity plus optional declaration overrides
///
/// An unset name means "use the exchange name".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueSpec {
    pub name: Option<String>,
    pub durable: Option<bool>,
    pub exclusive: Option<bool>,
    pub auto_delete: Option<bool>,
}

impl QueueSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = Some(exclusive);
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    /// Fill unset fields with defaults (durable, not exclusive, not auto-deleted)
    pub fn resolve(&self, exchange_name: &str) -> QueueDeclaration {
        QueueDeclaration {
            name: self
                .name
                .clone()
                .unwrap_or_else(|| exchange_name.to_string()),
            durable: self.durable.unwrap_or(DEFAULT_QUEUE_DURABLE),
            exclusive: self.exclusive.unwrap_or(DEFAULT_QUEUE_EXCLUSIVE),
            auto_delete: self.auto_delete.unwrap_or(DEFAULT_QUEUE_AUTO_DELETE),
        }
    }
}

impl From<&str> for QueueSpec {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

/// Optional arguments of `send_with`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub routing_key: String,
    pub delivery_mode: DeliveryMode,
    pub immediate: bool,
    pub mandatory: bool,
}

/// Optional arguments of `subscribe_with`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscribeOptions {
    pub routing_key: String,
    pub queue: QueueSpec,
    pub ack_mode: AckMode,
}

/// A durable intent to consume, replayed on every session
#[derive(Clone)]
pub struct Subscription {
    pub exchange: ExchangeSpec,
    pub routing_key: String,
    pub handler: Arc<dyn DeliveryHandler>,
    pub queue: QueueSpec,
    pub ack_mode: AckMode,
}

impl Subscription {
    pub fn new(
        exchange: ExchangeSpec,
        handler: Arc<dyn DeliveryHandler>,
        options: SubscribeOptions,
    ) -> Self {
        Self {
            exchange,
            routing_key: options.routing_key,
            handler,
            queue: options.queue,
            ack_mode: options.ack_mode,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("queue", &self.queue)
            .field("ack_mode", &self.ack_mode)
            .finish_non_exhaustive()
    }
}

/// One pending publish, owned by the supervisor's queue until a session dequeues it
#[derive(Debug)]
pub struct OutboundMessage {
    pub exchange: ExchangeSpec,
    pub routing_key: String,
    pub payload: Bytes,
    pub delivery_mode: DeliveryMode,
    pub immediate: bool,
    pub mandatory: bool,
    completion: oneshot::Sender<Result<(), PublishError>>,
}

impl OutboundMessage {
    pub fn new(exchange: ExchangeSpec, payload: Bytes, options: PublishOptions) -> (Self, PublishHandle) {
        let (completion, rx) = oneshot::channel();
        let message = Self {
            exchange,
            routing_key: options.routing_key,
            payload,
            delivery_mode: options.delivery_mode,
            immediate: options.immediate,
            mandatory: options.mandatory,
            completion,
        };
        (message, PublishHandle { rx })
    }

    pub fn publish_request(&self, exchange_name: &str) -> PublishRequest {
        PublishRequest {
            exchange: exchange_name.to_string(),
            routing_key: self.routing_key.clone(),
            payload: self.payload.clone(),
            delivery_mode: self.delivery_mode,
            immediate: self.immediate,
            mandatory: self.mandatory,
        }
    }

    /// Resolve the caller's handle; a caller that dropped its handle is not an error
    pub fn complete(self, result: Result<(), PublishError>) {
        let _ = self.completion.send(result);
    }
}

/// Resolves once the message has been published, or has failed to publish
///
/// Dropping the handle does not cancel the publish.
#[derive(Debug)]
pub struct PublishHandle {
    rx: oneshot::Receiver<Result<(), PublishError>>,
}

impl Future for PublishHandle {
    type Output = Result<(), PublishError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(PublishError::Abandoned)))
    }
}
