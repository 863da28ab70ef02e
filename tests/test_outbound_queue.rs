//! Outbound queue behavior
//!
//! Messages accepted by `send` are published exactly once, oldest first,
//! whether they were queued before the first connection, while ready, or
//! while the supervisor was reconnecting.

mod supervisor_test_helpers;

use amqp_supervisor::testing::MockBroker;
use amqp_supervisor::transport::Directive;
use amqp_supervisor::{
    BrokerError, ConnectionState, ConnectionSupervisor, DeliveryMode, PublishError,
    PublishOptions,
};
use proptest::prelude::*;
use supervisor_test_helpers::*;

#[tokio::test]
async fn test_messages_sent_before_connect_publish_in_order() {
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    let receipts: Vec<_> = ["one", "two", "three"]
        .into_iter()
        .map(|payload| supervisor.send("orders", payload).unwrap())
        .collect();
    assert_eq!(supervisor.pending_messages(), 3);

    supervisor.connect().unwrap();
    for receipt in receipts {
        within(receipt).await.unwrap();
    }

    assert_eq!(payloads(&broker.published()), vec!["one", "two", "three"]);
    assert_eq!(supervisor.pending_messages(), 0);
    assert_eq!(supervisor.metrics().publishing.messages_published, 3);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_send_while_ready_publishes_promptly() {
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    supervisor.connect().unwrap();
    within(supervisor.first_connected()).await;

    let options = PublishOptions {
        routing_key: "eu".to_string(),
        delivery_mode: DeliveryMode::Transient,
        mandatory: true,
        ..Default::default()
    };
    within(supervisor.send_with("orders", "live", options).unwrap())
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "eu");
    assert_eq!(published[0].delivery_mode, DeliveryMode::Transient);
    assert!(published[0].mandatory);
    assert!(!published[0].immediate);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_failed_publish_resolves_error_and_later_messages_succeed() {
    // Arrange: the broker refuses the first publish only
    let broker = MockBroker::new();
    broker.fail_next(Directive::Publish, 1);
    let mut supervisor = supervisor(&broker);
    let first = supervisor.send("orders", "rejected").unwrap();
    let second = supervisor.send("orders", "accepted").unwrap();

    // Act
    supervisor.connect().unwrap();

    // Assert: the failure is reported to its caller and not retried
    assert!(matches!(
        within(first).await,
        Err(PublishError::Broker(BrokerError::DirectiveFailed {
            directive: Directive::Publish,
            ..
        }))
    ));
    within(second).await.unwrap();
    assert_eq!(payloads(&broker.published()), vec!["rejected", "accepted"]);
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(supervisor.metrics().publishing.publish_failures, 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_failed_exchange_declare_fails_only_that_message() {
    let broker = MockBroker::new();
    broker.fail_next(Directive::DeclareExchange, 1);
    let mut supervisor = supervisor(&broker);
    let first = supervisor.send("orders", "first").unwrap();
    let second = supervisor.send("orders", "second").unwrap();

    supervisor.connect().unwrap();

    assert!(matches!(
        within(first).await,
        Err(PublishError::Broker(BrokerError::DirectiveFailed {
            directive: Directive::DeclareExchange,
            ..
        }))
    ));
    within(second).await.unwrap();
    assert_eq!(payloads(&broker.published()), vec!["second"]);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_connection_lost_mid_drain_resumes_on_next_session() {
    // Arrange: five queued messages; the transport dies right after the second publish
    let broker = MockBroker::new();
    broker.drop_connection_after_publishes(2);
    let mut supervisor = supervisor(&broker);
    let receipts: Vec<_> = (0..5)
        .map(|i| supervisor.send("orders", format!("m{i}")).unwrap())
        .collect();

    // Act
    supervisor.connect().unwrap();
    let mut outcomes = Vec::new();
    for receipt in receipts {
        outcomes.push(within(receipt).await);
    }

    // Assert: every handle resolved once; the message in flight at the drop
    // failed, the rest went out on the second session in order
    assert!(outcomes[0].is_ok());
    assert!(outcomes[1].is_ok());
    assert!(matches!(
        outcomes[2],
        Err(PublishError::Broker(BrokerError::ConnectionClosed(_)))
    ));
    assert!(outcomes[3].is_ok());
    assert!(outcomes[4].is_ok());

    assert_eq!(broker.connection_count(), 2);
    assert_eq!(published_in(&broker.session_calls(0)), vec!["m0", "m1"]);
    assert_eq!(published_in(&broker.session_calls(1)), vec!["m3", "m4"]);
    assert_eq!(supervisor.pending_messages(), 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_closed_channel_on_open_transport_forces_a_new_session() {
    // Arrange: ready, then the broker closes the channel but keeps the transport
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    supervisor.connect().unwrap();
    within(supervisor.first_connected()).await;
    assert!(broker.close_channel("PRECONDITION_FAILED - inequivalent arg"));

    // Act
    let first = supervisor.send("orders", "m1").unwrap();
    let first = within(first).await;
    let second = supervisor.send("orders", "m2").unwrap();

    // Assert: the failed publish is reported and the next one goes out on a fresh session
    assert!(matches!(
        first,
        Err(PublishError::Broker(BrokerError::ConnectionClosed(_)))
    ));
    within(second).await.unwrap();
    assert_eq!(broker.connection_count(), 2);
    assert_eq!(published_in(&broker.session_calls(1)), vec!["m2"]);
    assert_eq!(supervisor.metrics().connection.connections_lost, 1);
    wait_for_state(&supervisor, |state| *state == ConnectionState::Ready).await;

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_messages_sent_while_disconnected_wait_for_next_session() {
    // Arrange: connected, then the broker goes away and refuses reconnects for a while
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker);
    supervisor.connect().unwrap();
    within(supervisor.first_connected()).await;
    broker.refuse_connections(3);
    assert!(broker.drop_connection("broker restarting"));
    wait_for_state(&supervisor, |state| *state != ConnectionState::Ready).await;

    // Act
    let receipt = supervisor.send("orders", "while-down").unwrap();

    // Assert
    within(receipt).await.unwrap();
    assert_eq!(broker.connection_count(), 5);
    assert_eq!(published_in(&broker.session_calls(4)), vec!["while-down"]);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_dropping_supervisor_abandons_unsent_messages() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker);
    let receipt = supervisor.send("orders", "never").unwrap();

    drop(supervisor);

    assert!(matches!(
        within(receipt).await,
        Err(PublishError::Abandoned)
    ));
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_empty_exchange_is_rejected_synchronously() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker);

    assert!(supervisor.send("", "payload").is_err());
    assert!(supervisor.send("   ", "payload").is_err());
    assert_eq!(supervisor.pending_messages(), 0);
}

fn publish_all(before_connect: Vec<String>, after_ready: Vec<String>) -> Vec<String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let broker = MockBroker::new();
        let mut supervisor = ConnectionSupervisor::new(fast_config(), broker.connector()).unwrap();

        let mut receipts = Vec::new();
        for payload in &before_connect {
            receipts.push(supervisor.send("orders", payload.clone()).unwrap());
        }
        supervisor.connect().unwrap();
        within(supervisor.first_connected()).await;
        for payload in &after_ready {
            receipts.push(supervisor.send("orders", payload.clone()).unwrap());
        }

        for receipt in receipts {
            within(receipt).await.unwrap();
        }
        supervisor.shutdown().await;
        payloads(&broker.published())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_every_message_published_once_in_send_order(
        before_connect in prop::collection::vec("[a-z0-9]{1,12}", 0..16),
        after_ready in prop::collection::vec("[a-z0-9]{1,12}", 0..16),
    ) {
        let expected: Vec<String> = before_connect
            .iter()
            .chain(after_ready.iter())
            .cloned()
            .collect();

        let published = publish_all(before_connect, after_ready);

        prop_assert_eq!(published, expected);
    }
}
