//! Delivery dispatch tests
//!
//! Messages pushed by the broker reach the subscription's handler, manual
//! acknowledgements follow successful handling only, and a failing or slow
//! handler never stops its consumer.

mod supervisor_test_helpers;

use amqp_supervisor::testing::{BrokerCall, MockBroker};
use amqp_supervisor::transport::amqp::HandlerError;
use amqp_supervisor::{AckMode, Delivery, SubscribeOptions};
use std::time::Duration;
use supervisor_test_helpers::*;
use tokio::sync::mpsc;

fn manual_ack() -> SubscribeOptions {
    SubscribeOptions {
        routing_key: "eu".to_string(),
        ack_mode: AckMode::Manual,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_delivery_reaches_handler_and_is_acknowledged() {
    // Arrange
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |delivery: Delivery| {
        let tx = tx.clone();
        async move {
            tx.send(delivery)?;
            Ok::<(), HandlerError>(())
        }
    };
    supervisor
        .subscribe_with("orders", handler, manual_ack())
        .unwrap();
    supervisor.connect().unwrap();
    within(supervisor.first_connected()).await;

    // Act
    let delivery_tag = broker.deliver("1", "order-7").unwrap();

    // Assert
    let delivery = within(rx.recv()).await.unwrap();
    assert_eq!(delivery.delivery_tag, delivery_tag);
    assert_eq!(delivery.consumer_tag, "1");
    assert_eq!(delivery.exchange, "orders");
    assert_eq!(delivery.routing_key, "eu");
    assert_eq!(&delivery.payload[..], b"order-7");

    assert!(
        broker
            .wait_for(|calls| calls.contains(&BrokerCall::Ack(delivery_tag)))
            .await
    );

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_auto_ack_subscription_never_acks() {
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();
    supervisor
        .subscribe("orders", move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                tx.send(delivery.delivery_tag)?;
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    supervisor.connect().unwrap();
    within(supervisor.first_connected()).await;

    broker.deliver("1", "a").unwrap();
    within(rx.recv()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(broker.acked().is_empty());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_skips_ack_and_consumer_keeps_running() {
    // Arrange: a handler that rejects payloads starting with "bad"
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |delivery: Delivery| {
        let tx = tx.clone();
        async move {
            tx.send(delivery.delivery_tag)?;
            if delivery.payload.starts_with(b"bad") {
                return Err::<(), HandlerError>("unparseable order".into());
            }
            Ok(())
        }
    };
    supervisor
        .subscribe_with("orders", handler, manual_ack())
        .unwrap();
    supervisor.connect().unwrap();
    within(supervisor.first_connected()).await;

    // Act
    let bad = broker.deliver("1", "bad-order").unwrap();
    let good = broker.deliver("1", "good-order").unwrap();

    // Assert: both handled in order, only the successful one acknowledged
    assert_eq!(within(rx.recv()).await, Some(bad));
    assert_eq!(within(rx.recv()).await, Some(good));
    assert!(
        broker
            .wait_for(|calls| calls.contains(&BrokerCall::Ack(good)))
            .await
    );
    assert_eq!(broker.acked(), vec![good]);
    assert_eq!(supervisor.metrics().consuming.handler_failures, 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_slow_handler_does_not_block_other_subscriptions() {
    // Arrange: alpha's handler never finishes; beta's reports every delivery
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    supervisor
        .subscribe("alpha", |_delivery: Delivery| async {
            std::future::pending::<()>().await;
            Ok::<(), HandlerError>(())
        })
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    supervisor
        .subscribe("beta", move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                tx.send(delivery.payload)?;
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    supervisor.connect().unwrap();
    within(supervisor.first_connected()).await;

    // Act
    broker.deliver("1", "stuck").unwrap();
    broker.deliver("1", "queued-behind").unwrap();
    broker.deliver("2", "flows").unwrap();

    // Assert
    let payload = within(rx.recv()).await.unwrap();
    assert_eq!(&payload[..], b"flows");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_deliveries_resume_on_new_consumer_after_reconnect() {
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();
    supervisor
        .subscribe("orders", move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                tx.send(delivery.payload)?;
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    supervisor.connect().unwrap();
    within(supervisor.first_connected()).await;

    assert!(broker.drop_connection("reset"));
    assert!(broker.wait_for(|calls| count_consumers(calls) == 2).await);
    broker.deliver("1", "after-reconnect").unwrap();

    let payload = within(rx.recv()).await.unwrap();
    assert_eq!(&payload[..], b"after-reconnect");
    assert_eq!(supervisor.metrics().consuming.deliveries_received, 1);

    supervisor.shutdown().await;
}

/// Subscribes "alpha" and "beta", each reporting `(exchange, payload)` on the returned receiver
fn subscribe_reporting(
    supervisor: &amqp_supervisor::ConnectionSupervisor,
) -> mpsc::UnboundedReceiver<(String, String)> {
    let (tx, rx) = mpsc::unbounded_channel();
    for exchange in ["alpha", "beta"] {
        let tx = tx.clone();
        supervisor
            .subscribe(exchange, move |delivery: Delivery| {
                let tx = tx.clone();
                async move {
                    let payload = String::from_utf8_lossy(&delivery.payload).into_owned();
                    tx.send((delivery.exchange, payload))?;
                    Ok::<(), HandlerError>(())
                }
            })
            .unwrap();
    }
    rx
}

#[tokio::test]
async fn test_consumer_closed_by_broker_ends_quietly_until_reconnect() {
    // Arrange
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    let mut rx = subscribe_reporting(&supervisor);
    supervisor.connect().unwrap();
    within(supervisor.first_connected()).await;

    // Act: the broker cancels alpha's consumer
    assert!(broker.close_consumer("1"));

    // Assert: beta keeps flowing on the same session, alpha is not re-consumed
    broker.deliver("2", "still-flowing").unwrap();
    assert_eq!(
        within(rx.recv()).await,
        Some(("beta".to_string(), "still-flowing".to_string()))
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(supervisor.state(), amqp_supervisor::ConnectionState::Ready);
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(count_consumers(&broker.calls()), 2);
    assert!(broker.deliver("1", "nobody-listening").is_none());

    // A new session consumes alpha again
    assert!(broker.drop_connection("reset"));
    assert!(broker.wait_for(|calls| count_consumers(calls) == 4).await);
    broker.deliver("1", "back").unwrap();
    assert_eq!(
        within(rx.recv()).await,
        Some(("alpha".to_string(), "back".to_string()))
    );

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_delivery_stream_error_leaves_session_up() {
    // Arrange
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    let mut rx = subscribe_reporting(&supervisor);
    supervisor.connect().unwrap();
    within(supervisor.first_connected()).await;

    // Act
    assert!(broker.fail_consumer("1", "consumer stream reset"));

    // Assert: the other consumer and the publish path still work on the first session
    broker.deliver("2", "unaffected").unwrap();
    assert_eq!(
        within(rx.recv()).await,
        Some(("beta".to_string(), "unaffected".to_string()))
    );
    within(supervisor.send("alpha", "outbound").unwrap())
        .await
        .unwrap();
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(supervisor.state(), amqp_supervisor::ConnectionState::Ready);

    supervisor.shutdown().await;
}
