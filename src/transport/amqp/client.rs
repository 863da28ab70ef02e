//! Connection supervisor
//!
//! Owns the durable application intent (subscriptions and queued publishes)
//! and a background task that keeps exactly one session alive, reconnecting
//! with backoff whenever the transport is lost.

use super::connection::{ConnectionState, ReconnectConfig};
use super::declare::{
    ExchangeSpec, OutboundMessage, PublishHandle, PublishOptions, SubscribeOptions, Subscription,
};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::DeliveryHandler;
use super::session::Session;
use crate::config::{ConnectionConfig, SupervisorConfig};
use crate::error::{sanitize_error_message, SupervisorError, SupervisorResult};
use crate::observability::{MetricsCollector, MetricsSnapshot};
use crate::transport::{BrokerConnection, BrokerError, Connector};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Link to the session that is currently ready
struct ReadySession {
    id: u64,
    activations: mpsc::UnboundedSender<Arc<Subscription>>,
    drain: Arc<Notify>,
}

/// Application intent that outlives every session
#[derive(Default)]
struct Intent {
    subscriptions: Vec<Arc<Subscription>>,
    outbound: VecDeque<OutboundMessage>,
    ready: Option<ReadySession>,
}

/// State shared between the supervisor, its reconnection task and its sessions
pub(crate) struct Shared {
    config: ConnectionConfig,
    intent: Mutex<Intent>,
    metrics: Arc<MetricsCollector>,
    first_connected: watch::Sender<bool>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    pub(crate) fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            intent: Mutex::new(Intent::default()),
            metrics: Arc::new(MetricsCollector::new()),
            first_connected: watch::channel(false).0,
            state: watch::channel(ConnectionState::Idle).0,
        }
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    // Appends are always valid, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Intent> {
        self.intent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `id` the ready session, queueing the current subscription list for activation
    pub(crate) fn attach_session(
        &self,
        id: u64,
        activations: mpsc::UnboundedSender<Arc<Subscription>>,
        drain: Arc<Notify>,
    ) {
        let mut intent = self.lock();
        for subscription in &intent.subscriptions {
            let _ = activations.send(subscription.clone());
        }
        intent.ready = Some(ReadySession {
            id,
            activations,
            drain,
        });
    }

    pub(crate) fn detach_session(&self, id: u64) {
        let mut intent = self.lock();
        if intent.ready.as_ref().is_some_and(|ready| ready.id == id) {
            intent.ready = None;
        }
    }

    /// Dequeue the oldest message, but only for the session that is currently ready
    pub(crate) fn take_next_message(&self, session_id: u64) -> Option<OutboundMessage> {
        let mut intent = self.lock();
        match &intent.ready {
            Some(ready) if ready.id == session_id => intent.outbound.pop_front(),
            _ => None,
        }
    }

    fn enqueue(&self, message: OutboundMessage) {
        let mut intent = self.lock();
        intent.outbound.push_back(message);
        if let Some(ready) = &intent.ready {
            ready.drain.notify_one();
        }
    }

    fn add_subscription(&self, subscription: Arc<Subscription>) {
        let mut intent = self.lock();
        intent.subscriptions.push(subscription.clone());
        if let Some(ready) = &intent.ready {
            // A closed receiver means the session is going away; the next one replays the list.
            let _ = ready.activations.send(subscription);
        }
    }

    /// Fires once, the first time any session finishes entering ready
    pub(crate) fn signal_first_connected(&self) {
        let fired = self.first_connected.send_if_modified(|connected| {
            if *connected {
                false
            } else {
                *connected = true;
                true
            }
        });
        if fired {
            info!("First connection established");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn pending_messages(&self) -> usize {
        self.lock().outbound.len()
    }

    fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }
}

/// Keeps one logical AMQP connection alive and replays application intent on every reconnect
///
/// `send` and `subscribe` are accepted at any time, before `connect()` or
/// while disconnected; they take effect once a session is ready.
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    reconnect_config: ReconnectConfig,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    pub fn new(config: SupervisorConfig, connector: impl Connector) -> SupervisorResult<Self> {
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(
        config: SupervisorConfig,
        connector: Arc<dyn Connector>,
    ) -> SupervisorResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config.connection)),
            connector,
            reconnect_config: config.reconnect,
            shutdown_tx: watch::channel(false).0,
            task: None,
        })
    }

    /// Start the background reconnection task; must be called within a tokio runtime
    pub fn connect(&mut self) -> SupervisorResult<()> {
        if self.task.is_some() {
            return Err(SupervisorError::AlreadyStarted);
        }

        let reconnection = Reconnection {
            shared: self.shared.clone(),
            connector: self.connector.clone(),
            reconnect_config: self.reconnect_config.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        self.task = Some(tokio::spawn(reconnection.run()));
        Ok(())
    }

    /// Queue a persistent publish to `exchange` with an empty routing key
    pub fn send(
        &self,
        exchange: impl Into<ExchangeSpec>,
        payload: impl Into<Bytes>,
    ) -> SupervisorResult<PublishHandle> {
        self.send_with(exchange, payload, PublishOptions::default())
    }

    /// Queue a publish; the handle resolves once a session has published it
    pub fn send_with(
        &self,
        exchange: impl Into<ExchangeSpec>,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> SupervisorResult<PublishHandle> {
        let exchange = validate_exchange(exchange.into())?;
        let (message, handle) = OutboundMessage::new(exchange, payload.into(), options);
        self.shared.enqueue(message);
        Ok(handle)
    }

    /// Consume from `exchange` through a queue of the same name
    pub fn subscribe(
        &self,
        exchange: impl Into<ExchangeSpec>,
        handler: impl DeliveryHandler,
    ) -> SupervisorResult<()> {
        self.subscribe_with(exchange, handler, SubscribeOptions::default())
    }

    /// Register a durable subscription, replayed on every session
    pub fn subscribe_with(
        &self,
        exchange: impl Into<ExchangeSpec>,
        handler: impl DeliveryHandler,
        options: SubscribeOptions,
    ) -> SupervisorResult<()> {
        let exchange = validate_exchange(exchange.into())?;
        let subscription = Subscription::new(exchange, Arc::new(handler), options);
        self.shared.add_subscription(Arc::new(subscription));
        Ok(())
    }

    /// Resolves once the first session has become ready; later disconnects do not reset it
    pub async fn first_connected(&self) {
        let mut rx = self.shared.first_connected.subscribe();
        let _ = rx.wait_for(|connected| *connected).await;
    }

    /// Stop reconnecting and close the live connection
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("Reconnection task ended abnormally: {}", e);
            }
        }
        self.shared
            .set_state(ConnectionState::PermanentlyDisconnected(
                "shutdown requested".to_string(),
            ));
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let metrics = &self.shared.metrics;
        HealthMonitor::calculate_health_metrics(
            metrics.ready_since(),
            metrics.last_delivery(),
            u32::try_from(metrics.connections_lost()).unwrap_or(u32::MAX),
        )
    }

    /// Messages accepted by `send` that no session has taken yet
    pub fn pending_messages(&self) -> usize {
        self.shared.pending_messages()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscription_count()
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn validate_exchange(exchange: ExchangeSpec) -> SupervisorResult<ExchangeSpec> {
    if exchange.name.trim().is_empty() {
        return Err(SupervisorError::invalid_argument(
            "exchange name must not be empty",
        ));
    }
    Ok(exchange)
}

/// How a session ended
#[derive(Debug, PartialEq)]
enum SessionEnd {
    Shutdown,
    Lost { reached_ready: bool },
}

/// The background reconnection task
struct Reconnection {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    reconnect_config: ReconnectConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reconnection {
    async fn run(self) {
        info!(broker = %self.shared.config.address(), "Starting AMQP connection supervisor");
        let mut reconnect_attempts = 0u32;
        let mut next_session_id = 0u64;

        loop {
            self.shared.set_state(ConnectionState::Connecting);
            self.shared.metrics.connection_attempt();

            let connected = tokio::select! {
                biased;
                _ = shutdown_requested(self.shutdown_rx.clone()) => break,
                result = self.connector.connect(&self.shared.config) => result,
            };

            match connected {
                Ok(connection) => {
                    next_session_id += 1;
                    match self.run_session(next_session_id, connection).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost { reached_ready } => {
                            if reached_ready {
                                reconnect_attempts = 0;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.shared.metrics.connection_failed();
                    let reason = sanitize_error_message(&e.to_string());
                    self.shared.set_state(HealthMonitor::determine_next_state(
                        ConnectionEvent::ConnectFailed(reason),
                    ));
                }
            }

            let stopping = *self.shutdown_rx.borrow();
            match HealthMonitor::should_attempt_reconnection(
                reconnect_attempts,
                &self.reconnect_config,
                stopping,
            ) {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    reconnect_attempts = attempt;
                    self.shared.set_state(HealthMonitor::determine_next_state(
                        ConnectionEvent::ReconnectionStarted(attempt),
                    ));

                    let max_display = self
                        .reconnect_config
                        .max_attempts
                        .map_or("∞".to_string(), |max| max.to_string());
                    info!(
                        "Attempting reconnection {}/{} after {}ms delay",
                        attempt, max_display, delay_ms
                    );

                    if !interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                        break;
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => break,
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let reason = format!(
                        "Max reconnection attempts ({}) exceeded",
                        self.reconnect_config.max_attempts.unwrap_or(reconnect_attempts)
                    );
                    self.shared.set_state(HealthMonitor::determine_next_state(
                        ConnectionEvent::PermanentFailure(reason),
                    ));
                    return;
                }
            }
        }

        info!("AMQP connection supervisor stopped");
    }

    /// A fresh transport is up: build the session that will drive it
    fn on_connected(&self, id: u64, connection: Arc<dyn BrokerConnection>) -> Session {
        self.shared.set_state(HealthMonitor::determine_next_state(
            ConnectionEvent::TransportConnected,
        ));
        Session::new(id, connection, self.shared.clone())
    }

    /// Tear the session down; subscriptions and queued messages stay for the next one
    async fn on_disconnected(&self, mut session: Session, connection: &Arc<dyn BrokerConnection>) {
        session.close();
        drop(session);
        self.shared.metrics.connection_lost();
        if let Err(e) = connection.close().await {
            debug!("Closing transport failed: {}", e);
        }
    }

    fn on_lost(&self, reason: &str) -> SessionEnd {
        self.shared.set_state(HealthMonitor::determine_next_state(
            ConnectionEvent::ConnectionLost(sanitize_error_message(reason)),
        ));
        SessionEnd::Lost {
            reached_ready: true,
        }
    }

    async fn run_session(&self, id: u64, connection: Arc<dyn BrokerConnection>) -> SessionEnd {
        let mut session = self.on_connected(id, connection.clone());

        let handshake = tokio::select! {
            biased;
            _ = shutdown_requested(self.shutdown_rx.clone()) => {
                self.on_disconnected(session, &connection).await;
                return SessionEnd::Shutdown;
            }
            reason = connection.closed() => Err(BrokerError::ConnectionClosed(reason)),
            result = session.handshake() => result,
        };

        if let Err(e) = handshake {
            self.shared.metrics.handshake_failed();
            let reason = sanitize_error_message(&e.to_string());
            self.shared.set_state(HealthMonitor::determine_next_state(
                ConnectionEvent::HandshakeFailed(reason),
            ));
            self.on_disconnected(session, &connection).await;
            return SessionEnd::Lost {
                reached_ready: false,
            };
        }

        self.shared.metrics.session_ready();
        self.shared.set_state(HealthMonitor::determine_next_state(
            ConnectionEvent::SessionReady,
        ));

        let end = tokio::select! {
            biased;
            _ = shutdown_requested(self.shutdown_rx.clone()) => SessionEnd::Shutdown,
            reason = connection.closed() => self.on_lost(&reason),
            reason = session.worker_stopped() => self.on_lost(&reason),
        };

        self.on_disconnected(session, &connection).await;
        end
    }
}

/// Resolves once shutdown is requested or the supervisor is gone
async fn shutdown_requested(mut shutdown_rx: watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|requested| *requested).await;
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = shutdown_requested(shutdown_rx) => {
            info!("Shutdown signal received during reconnection delay, stopping");
            false
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}
