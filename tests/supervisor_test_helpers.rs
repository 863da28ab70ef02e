//! Shared helpers for supervisor integration tests
//!
//! Every test runs the real supervisor against the in-memory broker with a
//! millisecond backoff, so reconnect scenarios finish quickly.

#![allow(dead_code)]

use amqp_supervisor::testing::{BrokerCall, MockBroker};
use amqp_supervisor::transport::amqp::BackoffStrategy;
use amqp_supervisor::transport::PublishRequest;
use amqp_supervisor::{
    ConnectionState, ConnectionSupervisor, Delivery, HandlerResult, ReconnectConfig,
    SupervisorConfig,
};
use std::future::Future;
use std::time::Duration;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with a 1-5ms backoff and unlimited attempts
pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        reconnect: ReconnectConfig {
            max_attempts: None,
            backoff: BackoffStrategy::Pattern {
                delays_ms: vec![1, 2, 5],
                sustained_ms: 5,
            },
        },
        ..Default::default()
    }
}

pub fn supervisor(broker: &MockBroker) -> ConnectionSupervisor {
    ConnectionSupervisor::new(fast_config(), broker.connector())
        .expect("Default config should be valid")
}

/// Handler that accepts and drops every delivery
pub async fn ignore(_delivery: Delivery) -> HandlerResult {
    Ok(())
}

/// Await `future`, failing the test if it takes longer than [`TEST_TIMEOUT`]
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("Timed out waiting for the supervisor")
}

pub async fn wait_for_state<F>(supervisor: &ConnectionSupervisor, predicate: F) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    let mut states = supervisor.state_changes();
    let state = within(states.wait_for(|state| predicate(state)))
        .await
        .expect("Supervisor state channel closed");
    state.clone()
}

pub fn payloads(requests: &[PublishRequest]) -> Vec<String> {
    requests
        .iter()
        .map(|request| String::from_utf8_lossy(&request.payload).into_owned())
        .collect()
}

pub fn published_in(calls: &[BrokerCall]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|call| match call {
            BrokerCall::Publish(request) => {
                Some(String::from_utf8_lossy(&request.payload).into_owned())
            }
            _ => None,
        })
        .collect()
}

/// `(queue, consumer_tag)` of every consumer started in `calls`, in order
pub fn consumers_in(calls: &[BrokerCall]) -> Vec<(String, String)> {
    calls
        .iter()
        .filter_map(|call| match call {
            BrokerCall::StartConsuming {
                queue,
                consumer_tag,
                ..
            } => Some((queue.clone(), consumer_tag.clone())),
            _ => None,
        })
        .collect()
}

pub fn count_consumers(calls: &[BrokerCall]) -> usize {
    consumers_in(calls).len()
}
