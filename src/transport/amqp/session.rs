//! One authenticated, channel-open connection instance
//!
//! A session drives the handshake (`Connecting -> Authenticating ->
//! ChannelOpening -> Ready`), then hands control to a single worker task
//! that activates subscriptions and drains the outbound queue. Routing every
//! control-plane directive through that one task keeps the order in which
//! they reach the broker deterministic. Sessions are never reused; dropping
//! one aborts all of its tasks.

use super::client::Shared;
use super::connection::SessionState;
use super::declare::{OutboundMessage, Subscription};
use super::message_handler::DeliveryLoop;
use crate::error::PublishError;
use crate::session_span;
use crate::transport::{BrokerChannel, BrokerConnection, BrokerError};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument, Span};

pub struct Session {
    id: u64,
    state: SessionState,
    connection: Arc<dyn BrokerConnection>,
    shared: Arc<Shared>,
    tasks: JoinSet<String>,
    span: Span,
}

impl Session {
    /// Wrap a freshly connected transport; the handshake has not started
    pub(crate) fn new(id: u64, connection: Arc<dyn BrokerConnection>, shared: Arc<Shared>) -> Self {
        let span = session_span!(session_id = id, broker = %shared.config().address());
        Self {
            id,
            state: SessionState::Connecting,
            connection,
            shared,
            tasks: JoinSet::new(),
            span,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {} -> {}",
            self.state,
            next
        );
        debug!(parent: &self.span, from = %self.state, to = %next, "Session state change");
        self.state = next;
    }

    /// Authenticate, open the control channel, apply QoS, then go ready
    ///
    /// Any failure closes the session and is returned to the supervisor.
    pub(crate) async fn handshake(&mut self) -> Result<(), BrokerError> {
        match self.open().await {
            Ok(channel) => {
                self.become_ready(channel);
                Ok(())
            }
            Err(e) => {
                error!(parent: &self.span, "Session handshake failed in {}: {}", self.state, e);
                self.close();
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.transition(SessionState::Authenticating);
        let credentials = self.shared.config().credentials();
        self.connection.authenticate(&credentials).await?;
        debug!(parent: &self.span, username = %credentials.username, "Authenticated");

        self.transition(SessionState::ChannelOpening);
        let channel = self.connection.open_channel().await?;

        if let Some(prefetch_count) = self.shared.config().prefetch_count {
            channel
                .set_qos(prefetch_count)
                .await
                .map_err(|e| BrokerError::ChannelOpenFailed(Box::new(e)))?;
            debug!(parent: &self.span, prefetch_count, "QoS applied");
        }

        Ok(channel)
    }

    fn become_ready(&mut self, channel: Arc<dyn BrokerChannel>) {
        self.transition(SessionState::Ready);
        info!(parent: &self.span, "Session ready");

        let (activations_tx, activations) = mpsc::unbounded_channel();
        let drain = Arc::new(Notify::new());

        // Snapshot of the subscription list lands in the channel before
        // live forwarding starts, under the same lock.
        self.shared
            .attach_session(self.id, activations_tx, drain.clone());

        let worker = SessionWorker {
            session_id: self.id,
            channel,
            shared: self.shared.clone(),
            activations,
            drain,
            next_consumer_tag: 1,
            deliveries: JoinSet::new(),
        };
        self.tasks.spawn(worker.run().instrument(self.span.clone()));
    }

    /// Resolves with the reason once the worker has stopped on its own
    ///
    /// A worker stops when its channel is gone even though the transport
    /// may still look open, so the session is no longer usable.
    pub(crate) async fn worker_stopped(&mut self) -> String {
        match self.tasks.join_next().await {
            Some(Ok(reason)) => reason,
            Some(Err(e)) => format!("session worker failed: {e}"),
            None => std::future::pending().await,
        }
    }

    /// Enter `Closed`: stop forwarding and abort every task of this session
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transition(SessionState::Closed);
        self.shared.detach_session(self.id);
        self.tasks.abort_all();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.detach_session(self.id);
    }
}

/// Control-plane task of a ready session
struct SessionWorker {
    session_id: u64,
    channel: Arc<dyn BrokerChannel>,
    shared: Arc<Shared>,
    activations: mpsc::UnboundedReceiver<Arc<Subscription>>,
    drain: Arc<Notify>,
    next_consumer_tag: u64,
    deliveries: JoinSet<()>,
}

impl SessionWorker {
    /// Returns why the worker stopped
    async fn run(mut self) -> String {
        let replayed = self.replay().await;
        // The session reached ready whether or not the replay got through
        self.shared.signal_first_connected();
        if let Err(reason) = replayed {
            return reason;
        }

        let reason = loop {
            let step = tokio::select! {
                biased;
                next = self.activations.recv() => match next {
                    Some(subscription) => self.activate(&subscription).await,
                    None => break "session detached".to_string(),
                },
                _ = self.drain.notified() => self.drain_outbound().await,
                Some(_) = self.deliveries.join_next(), if !self.deliveries.is_empty() => Ok(()),
            };
            if let Err(reason) = step {
                break reason;
            }
        };
        debug!(reason = %reason, "Session worker stopped");
        reason
    }

    /// Replay the durable list, then flush what queued up while offline
    async fn replay(&mut self) -> Result<(), String> {
        while let Ok(subscription) = self.activations.try_recv() {
            self.activate(&subscription).await?;
        }
        self.drain_outbound().await
    }

    fn allocate_consumer_tag(&mut self) -> String {
        let tag = self.next_consumer_tag.to_string();
        self.next_consumer_tag += 1;
        tag
    }

    /// Errors only when the channel is gone; other failures skip this subscription
    async fn activate(&mut self, subscription: &Arc<Subscription>) -> Result<(), String> {
        let exchange = subscription.exchange.name.clone();
        match self.try_activate(subscription).await {
            Ok(consumer_tag) => {
                self.shared.metrics().subscription_activated();
                info!(
                    exchange = %exchange,
                    routing_key = %subscription.routing_key,
                    consumer_tag = %consumer_tag,
                    "Subscription active"
                );
                Ok(())
            }
            Err(e) => {
                self.shared.metrics().activation_failed();
                error!(exchange = %exchange, "Subscription activation failed: {}", e);
                match e {
                    BrokerError::ConnectionClosed(reason) => Err(reason),
                    _ => Ok(()),
                }
            }
        }
    }

    async fn try_activate(&mut self, subscription: &Arc<Subscription>) -> Result<String, BrokerError> {
        let exchange = subscription.exchange.resolve();
        self.channel.declare_exchange(&exchange).await?;

        let queue = subscription.queue.resolve(&exchange.name);
        self.channel.declare_queue(&queue).await?;
        self.channel
            .bind_queue(&queue.name, &exchange.name, &subscription.routing_key)
            .await?;

        let consumer_tag = self.allocate_consumer_tag();
        let stream = self
            .channel
            .start_consuming(&queue.name, &consumer_tag, subscription.ack_mode)
            .await?;

        DeliveryLoop {
            subscription: subscription.clone(),
            channel: self.channel.clone(),
            consumer_tag: consumer_tag.clone(),
            metrics: self.shared.metrics().clone(),
        }
        .spawn(&mut self.deliveries, stream);

        Ok(consumer_tag)
    }

    /// Publish queued messages oldest first until the queue is empty
    ///
    /// Errors once the channel is gone; the rest of the queue is left for
    /// the next session.
    async fn drain_outbound(&mut self) -> Result<(), String> {
        while let Some(message) = self.shared.take_next_message(self.session_id) {
            let result = self.publish(&message).await;
            let connection_lost = match &result {
                Err(BrokerError::ConnectionClosed(reason)) => Some(reason.clone()),
                _ => None,
            };

            match &result {
                Ok(()) => self.shared.metrics().message_published(),
                Err(e) => {
                    self.shared.metrics().publish_failed();
                    warn!(exchange = %message.exchange.name, "Publish failed: {}", e);
                }
            }
            message.complete(result.map_err(PublishError::from));

            if let Some(reason) = connection_lost {
                return Err(reason);
            }
        }
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        let exchange = message.exchange.resolve();
        self.channel.declare_exchange(&exchange).await?;
        self.channel
            .publish(&message.publish_request(&exchange.name))
            .await
    }
}
