//! Testing utilities and mock implementations
//!
//! An in-memory broker that stands in for a real AMQP server, so the
//! supervisor can be exercised end to end in unit and integration tests.

pub mod mocks;

pub use mocks::*;
