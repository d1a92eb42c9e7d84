//! Messages accepted by an account worker.

use tokio::sync::oneshot;

use crate::bus::{BrokerOrder, DeliveryAck};

/// Command posted to a worker's desk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeskCommand {
    /// Run one inbound fetch cycle.
    Poll,
    /// Shut the worker down.
    Stop,
}

/// Outbound delivery handed to a worker's egress loop.
#[derive(Debug)]
pub struct EgressRequest {
    pub order: BrokerOrder,
    /// Answered exactly once with the outcome of the send.
    pub ack: oneshot::Sender<DeliveryAck>,
}

impl EgressRequest {
    pub fn new(order: BrokerOrder) -> (Self, oneshot::Receiver<DeliveryAck>) {
        let (ack, rx) = oneshot::channel();
        (Self { order, ack }, rx)
    }
}
