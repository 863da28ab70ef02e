//! In-memory broker for testing
//!
//! [`MockBroker`] records every directive the supervisor issues as a
//! [`BrokerCall`] and lets tests inject failures, push deliveries to
//! consumers and cut the transport, all without a running broker.

use crate::config::{ConnectionConfig, Credentials};
use crate::transport::{
    AckMode, BrokerChannel, BrokerConnection, BrokerError, Connector, Delivery, DeliveryStream,
    Directive, ExchangeDeclaration, PublishRequest, QueueDeclaration,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How long [`MockBroker::wait_for`] polls before giving up
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sender side of a mock consumer's delivery stream
pub type DeliveryFeed = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

/// One directive as observed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Connect,
    Authenticate {
        username: String,
    },
    OpenChannel,
    SetQos(u16),
    DeclareExchange(ExchangeDeclaration),
    DeclareQueue(QueueDeclaration),
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    StartConsuming {
        queue: String,
        consumer_tag: String,
        ack_mode: AckMode,
    },
    Publish(PublishRequest),
    Ack(u64),
    Close,
}

type CloseSignal = Arc<watch::Sender<Option<String>>>;

struct Consumer {
    queue: String,
    feed: DeliveryFeed,
}

#[derive(Default)]
struct BrokerState {
    calls: Vec<BrokerCall>,
    refused_connects: usize,
    auth_failures: usize,
    channel_failures: usize,
    directive_failures: HashMap<Directive, usize>,
    drop_after_publishes: Option<usize>,
    bindings: HashMap<String, (String, String)>,
    consumers: HashMap<String, Consumer>,
    live: Option<CloseSignal>,
    channel_closed: Option<String>,
    next_delivery_tag: u64,
}

impl BrokerState {
    /// Close the live transport; its consumers' streams end
    fn drop_live(&mut self, reason: &str) -> bool {
        match self.live.take() {
            Some(signal) => {
                signal.send_replace(Some(reason.to_string()));
                self.consumers.clear();
                true
            }
            None => false,
        }
    }

    fn take_failure(&mut self, directive: Directive) -> bool {
        match self.directive_failures.get_mut(&directive) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Shared in-memory broker; clones observe the same state
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connector that opens transports to this broker
    pub fn connector(&self) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    /// A channel not tied to any transport, for driving delivery loops directly
    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        Arc::new(MockChannel {
            broker: self.clone(),
            closed: watch::channel(None).1,
        })
    }

    /// A standalone delivery stream and the feed that drives it
    pub fn delivery_stream() -> (Box<dyn DeliveryStream>, DeliveryFeed) {
        let (feed, rx) = mpsc::unbounded_channel();
        (Box::new(MockDeliveryStream { rx }), feed)
    }

    // Failure injection

    /// Refuse the next `count` transport connects
    pub fn refuse_connections(&self, count: usize) {
        self.lock().refused_connects = count;
    }

    pub fn fail_authentication(&self, count: usize) {
        self.lock().auth_failures = count;
    }

    pub fn fail_channel_open(&self, count: usize) {
        self.lock().channel_failures = count;
    }

    /// Fail the next `count` calls of `directive`
    pub fn fail_next(&self, directive: Directive, count: usize) {
        self.lock().directive_failures.insert(directive, count);
    }

    /// Cut the live transport right after the next `count` successful publishes
    pub fn drop_connection_after_publishes(&self, count: usize) {
        self.lock().drop_after_publishes = Some(count);
    }

    /// Cut the live transport; returns false if none was live
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.lock().drop_live(reason)
    }

    /// Close the live transport's channels while the transport itself stays open
    ///
    /// Every later channel directive fails with `ConnectionClosed` and the
    /// consumers' streams end; `closed()` keeps pending. Returns false if no
    /// transport was live.
    pub fn close_channel(&self, reason: &str) -> bool {
        let mut state = self.lock();
        if state.live.is_none() {
            return false;
        }
        state.channel_closed = Some(reason.to_string());
        state.consumers.clear();
        true
    }

    // Consumers

    /// Push a message to the consumer registered under `consumer_tag`
    ///
    /// Returns the delivery tag, or None if no such consumer is live.
    pub fn deliver(&self, consumer_tag: &str, payload: impl Into<Bytes>) -> Option<u64> {
        let mut state = self.lock();
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;

        let consumer = state.consumers.get(consumer_tag)?;
        let (exchange, routing_key) = state
            .bindings
            .get(&consumer.queue)
            .cloned()
            .unwrap_or_default();
        let delivery = Delivery {
            delivery_tag,
            consumer_tag: consumer_tag.to_string(),
            exchange,
            routing_key,
            redelivered: false,
            payload: payload.into(),
        };
        consumer.feed.send(Ok(delivery)).ok()?;
        Some(delivery_tag)
    }

    /// End one consumer's stream, as a broker-side cancel would
    pub fn close_consumer(&self, consumer_tag: &str) -> bool {
        self.lock().consumers.remove(consumer_tag).is_some()
    }

    /// Push a stream error to one consumer and forget it
    pub fn fail_consumer(&self, consumer_tag: &str, reason: &str) -> bool {
        match self.lock().consumers.remove(consumer_tag) {
            Some(consumer) => consumer
                .feed
                .send(Err(BrokerError::ConnectionClosed(reason.to_string())))
                .is_ok(),
            None => false,
        }
    }

    /// Tags of the consumers on the live transport, sorted
    pub fn consumer_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.lock().consumers.keys().cloned().collect();
        tags.sort();
        tags
    }

    // Inspection

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| **call == BrokerCall::Connect)
            .count()
    }

    /// Calls issued on the `index`-th transport (0-based), excluding its `Connect`
    pub fn session_calls(&self, index: usize) -> Vec<BrokerCall> {
        self.lock()
            .calls
            .split(|call| *call == BrokerCall::Connect)
            .nth(index + 1)
            .map(|calls| calls.to_vec())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Publish(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Ack(tag) => Some(*tag),
                _ => None,
            })
            .collect()
    }

    /// Poll the call log until `predicate` holds; false after a timeout
    pub async fn wait_for<F>(&self, predicate: F) -> bool
    where
        F: Fn(&[BrokerCall]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let satisfied = {
                let state = self.lock();
                predicate(&state.calls)
            };
            if satisfied {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// [`Connector`] over a [`MockBroker`]
#[derive(Clone)]
pub struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.broker.lock();
        state.calls.push(BrokerCall::Connect);

        if state.refused_connects > 0 {
            state.refused_connects -= 1;
            return Err(BrokerError::ConnectFailed("connection refused".into()));
        }

        state.drop_live("replaced by a new connection");
        state.channel_closed = None;
        let (signal, closed) = watch::channel(None);
        let signal = Arc::new(signal);
        state.live = Some(signal.clone());

        Ok(Arc::new(MockConnection {
            broker: self.broker.clone(),
            signal,
            closed,
        }))
    }
}

struct MockConnection {
    broker: MockBroker,
    signal: CloseSignal,
    closed: watch::Receiver<Option<String>>,
}

impl MockConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        match self.closed.borrow().as_ref() {
            Some(reason) => Err(BrokerError::ConnectionClosed(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.calls.push(BrokerCall::Authenticate {
            username: credentials.username.clone(),
        });
        if state.auth_failures > 0 {
            state.auth_failures -= 1;
            return Err(BrokerError::AuthenticationFailed(
                "ACCESS_REFUSED - Login was refused".into(),
            ));
        }
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.calls.push(BrokerCall::OpenChannel);
        if state.channel_failures > 0 {
            state.channel_failures -= 1;
            return Err(BrokerError::ChannelOpenFailed("channel.open refused".into()));
        }
        Ok(Arc::new(MockChannel {
            broker: self.broker.clone(),
            closed: self.closed.clone(),
        }))
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        let reason = match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        };
        reason
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.calls.push(BrokerCall::Close);
        if state
            .live
            .as_ref()
            .is_some_and(|live| Arc::ptr_eq(live, &self.signal))
        {
            state.drop_live("closed by client");
        } else {
            self.signal.send_if_modified(|reason| {
                if reason.is_some() {
                    return false;
                }
                *reason = Some("closed by client".to_string());
                true
            });
        }
        Ok(())
    }
}

struct MockChannel {
    broker: MockBroker,
    closed: watch::Receiver<Option<String>>,
}

impl MockChannel {
    /// Record `call`, failing if the transport is gone or a failure was injected
    fn record(&self, call: BrokerCall, directive: Directive) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        if let Some(reason) = self.closed.borrow().as_ref() {
            return Err(BrokerError::ConnectionClosed(reason.clone()));
        }
        let mut state = self.broker.lock();
        if let Some(reason) = &state.channel_closed {
            return Err(BrokerError::ConnectionClosed(reason.clone()));
        }
        state.calls.push(call);
        if state.take_failure(directive) {
            return Err(BrokerError::directive(
                directive,
                format!("injected {directive} failure"),
            ));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.record(BrokerCall::SetQos(prefetch_count), Directive::SetQos)
            .map(drop)
    }

    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), BrokerError> {
        self.record(
            BrokerCall::DeclareExchange(exchange.clone()),
            Directive::DeclareExchange,
        )
        .map(drop)
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), BrokerError> {
        self.record(BrokerCall::DeclareQueue(queue.clone()), Directive::DeclareQueue)
            .map(drop)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let call = BrokerCall::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        let mut state = self.record(call, Directive::BindQueue)?;
        state.bindings.insert(
            queue.to_string(),
            (exchange.to_string(), routing_key.to_string()),
        );
        Ok(())
    }

    async fn start_consuming(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let call = BrokerCall::StartConsuming {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            ack_mode,
        };
        let mut state = self.record(call, Directive::StartConsuming)?;
        let (feed, rx) = mpsc::unbounded_channel();
        state.consumers.insert(
            consumer_tag.to_string(),
            Consumer {
                queue: queue.to_string(),
                feed,
            },
        );
        Ok(Box::new(MockDeliveryStream { rx }))
    }

    async fn publish(&self, request: &PublishRequest) -> Result<(), BrokerError> {
        let mut state = self.record(BrokerCall::Publish(request.clone()), Directive::Publish)?;
        if let Some(remaining) = state.drop_after_publishes {
            let remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                state.drop_after_publishes = None;
                state.drop_live("connection reset by peer");
            } else {
                state.drop_after_publishes = Some(remaining);
            }
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.record(BrokerCall::Ack(delivery_tag), Directive::Ack)
            .map(drop)
    }
}

struct MockDeliveryStream {
    rx: mpsc::UnboundedReceiver<Result<Delivery, BrokerError>>,
}

#[async_trait]
impl DeliveryStream for MockDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connections_are_recorded() {
        let broker = MockBroker::new();
        broker.refuse_connections(1);
        let connector = broker.connector();

        assert!(connector.connect(&ConnectionConfig::default()).await.is_err());
        assert!(connector.connect(&ConnectionConfig::default()).await.is_ok());
        assert_eq!(broker.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_connection_fails_directives() {
        let broker = MockBroker::new();
        let connection = broker
            .connector()
            .connect(&ConnectionConfig::default())
            .await
            .unwrap();
        let channel = connection.open_channel().await.unwrap();

        assert!(broker.drop_connection("reset"));
        assert_eq!(connection.closed().await, "reset");
        assert!(matches!(
            channel.ack(1).await,
            Err(BrokerError::ConnectionClosed(_))
        ));
        assert!(!broker.drop_connection("again"));
    }

    #[tokio::test]
    async fn test_closed_channel_fails_directives_but_transport_stays_open() {
        let broker = MockBroker::new();
        let connection = broker
            .connector()
            .connect(&ConnectionConfig::default())
            .await
            .unwrap();
        let channel = connection.open_channel().await.unwrap();

        assert!(broker.close_channel("PRECONDITION_FAILED"));
        assert!(matches!(
            channel.ack(1).await,
            Err(BrokerError::ConnectionClosed(reason)) if reason == "PRECONDITION_FAILED"
        ));
        let still_open =
            tokio::time::timeout(Duration::from_millis(20), connection.closed()).await;
        assert!(still_open.is_err());

        // A fresh transport gets working channels again
        let connection = broker
            .connector()
            .connect(&ConnectionConfig::default())
            .await
            .unwrap();
        let channel = connection.open_channel().await.unwrap();
        assert!(channel.ack(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_deliver_reaches_consumer() {
        let broker = MockBroker::new();
        let connection = broker
            .connector()
            .connect(&ConnectionConfig::default())
            .await
            .unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel.bind_queue("orders", "orders", "eu").await.unwrap();
        let mut stream = channel
            .start_consuming("orders", "1", AckMode::Auto)
            .await
            .unwrap();

        let tag = broker.deliver("1", "payload").unwrap();
        let delivery = stream.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.delivery_tag, tag);
        assert_eq!(delivery.exchange, "orders");
        assert_eq!(delivery.routing_key, "eu");
        assert_eq!(delivery.payload, Bytes::from_static(b"payload"));

        assert!(broker.close_consumer("1"));
        assert!(stream.next_delivery().await.is_none());
        assert!(broker.deliver("1", "late").is_none());
    }

    #[tokio::test]
    async fn test_injected_directive_failure_is_one_shot() {
        let broker = MockBroker::new();
        broker.fail_next(Directive::Publish, 1);
        let channel = broker.channel();
        let request = PublishRequest {
            exchange: "orders".to_string(),
            routing_key: String::new(),
            payload: Bytes::from_static(b"x"),
            delivery_mode: Default::default(),
            immediate: false,
            mandatory: false,
        };

        assert!(channel.publish(&request).await.is_err());
        assert!(channel.publish(&request).await.is_ok());
        assert_eq!(broker.published().len(), 2);
    }
}
