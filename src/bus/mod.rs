//! Message bus abstraction and command routing.
//!
//! - `envelope` — `BrokerOrder` / `DeliveryAck` wire types
//! - `local` — in-process bus used by the binary and tests
//! - `router` — decodes bus commands and drives the worker registry

pub mod envelope;
pub mod local;
pub mod router;

pub use envelope::{BrokerOrder, DeliveryAck, OrderKind};
pub use local::LocalBus;
pub use router::Router;

use async_trait::async_trait;

use crate::error::BusError;

/// A message received from the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    /// Where the sender expects an answer, if anywhere.
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

/// Publish side of a subject-based message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload with no reply subject.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Publish a payload that expects an answer on `reply`.
    async fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;
}
