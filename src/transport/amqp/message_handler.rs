//! Delivery handling for active subscriptions
//!
//! Each active subscription runs two tasks: a reader that pulls deliveries
//! off the broker stream and immediately re-arms, and a dispatcher that
//! invokes the application handler. They are joined by an unbounded mpsc
//! channel, so reception never waits for a slow handler. Handler calls of
//! one subscription are serialized; different subscriptions run concurrently.

use super::declare::Subscription;
use crate::delivery_span;
use crate::observability::MetricsCollector;
use crate::transport::{AckMode, BrokerChannel, Delivery, DeliveryStream};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn, Instrument};

/// Error returned by an application handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Application callback invoked once per delivered message
///
/// Any `Fn(Delivery) -> impl Future<Output = HandlerResult>` closure is a handler.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> DeliveryHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        (self)(delivery).await
    }
}

/// Everything a delivery loop needs besides its stream
pub(crate) struct DeliveryLoop {
    pub subscription: Arc<Subscription>,
    pub channel: Arc<dyn BrokerChannel>,
    pub consumer_tag: String,
    pub metrics: Arc<MetricsCollector>,
}

impl DeliveryLoop {
    /// Spawn the reader and dispatcher tasks into the session's task set
    pub fn spawn(self, tasks: &mut JoinSet<()>, stream: Box<dyn DeliveryStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = delivery_span!(
            consumer_tag = %self.consumer_tag,
            exchange = %self.subscription.exchange.name
        );

        tasks.spawn(read_deliveries(stream, tx).instrument(span.clone()));
        tasks.spawn(self.dispatch(rx).instrument(span));
    }

    async fn dispatch(self, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            self.metrics.delivery_received();
            let delivery_tag = delivery.delivery_tag;

            match self.subscription.handler.handle(delivery).await {
                Ok(()) => {
                    if self.subscription.ack_mode == AckMode::Manual {
                        self.acknowledge(delivery_tag).await;
                    }
                }
                Err(e) => {
                    self.metrics.handler_failed();
                    warn!(
                        delivery_tag,
                        "Delivery handler failed, message not acknowledged: {}", e
                    );
                }
            }
        }
        debug!("Delivery dispatcher finished");
    }

    async fn acknowledge(&self, delivery_tag: u64) {
        match self.channel.ack(delivery_tag).await {
            Ok(()) => self.metrics.ack_sent(),
            Err(e) => warn!(delivery_tag, "Failed to acknowledge delivery: {}", e),
        }
    }
}

/// Pull deliveries until the broker closes the consumer or the stream fails
async fn read_deliveries(
    mut stream: Box<dyn DeliveryStream>,
    tx: mpsc::UnboundedSender<Delivery>,
) {
    while let Some(next) = stream.next_delivery().await {
        match next {
            Ok(delivery) => {
                if tx.send(delivery).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Delivery stream failed: {}", e);
                return;
            }
        }
    }
    debug!("Consumer closed by broker");
}
