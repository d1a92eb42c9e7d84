//! Cloneable control handle of a running account worker.

use std::time::Duration;

use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};

use super::command::{DeskCommand, EgressRequest};
use crate::bus::{BrokerOrder, DeliveryAck};
use crate::error::WorkerError;
use crate::identity::IdentityKey;

#[derive(Debug, Clone)]
pub struct WorkerHandle {
    key: IdentityKey,
    desk: mpsc::Sender<DeskCommand>,
    egress: mpsc::Sender<EgressRequest>,
}

impl WorkerHandle {
    pub(crate) fn new(
        key: IdentityKey,
        desk: mpsc::Sender<DeskCommand>,
        egress: mpsc::Sender<EgressRequest>,
    ) -> Self {
        Self { key, desk, egress }
    }

    pub fn key(&self) -> IdentityKey {
        self.key
    }

    /// Whether the desk loop is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.desk.is_closed()
    }

    /// Whether both handles drive the same worker instance.
    pub fn same_worker(&self, other: &WorkerHandle) -> bool {
        self.desk.same_channel(&other.desk)
    }

    /// Post a command, waiting at most `budget` for room on the desk.
    pub async fn enqueue(&self, command: DeskCommand, budget: Duration) -> Result<(), WorkerError> {
        match self.desk.send_timeout(command, budget).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(WorkerError::DeskFull {
                key: self.key.to_string(),
                timeout: budget,
            }),
            Err(SendTimeoutError::Closed(_)) => Err(self.stopped()),
        }
    }

    /// Offer an outbound order to the egress loop, waiting at most `budget`.
    ///
    /// On success the returned receiver resolves with the delivery ack.
    pub async fn deliver(
        &self,
        order: BrokerOrder,
        budget: Duration,
    ) -> Result<oneshot::Receiver<DeliveryAck>, WorkerError> {
        let (request, ack) = EgressRequest::new(order);
        match self.egress.send_timeout(request, budget).await {
            Ok(()) => Ok(ack),
            Err(SendTimeoutError::Timeout(_)) => Err(WorkerError::EgressFull {
                key: self.key.to_string(),
                timeout: budget,
            }),
            Err(SendTimeoutError::Closed(_)) => Err(self.stopped()),
        }
    }

    /// Ask the worker to stop. Stopping a stopped worker is a no-op.
    pub fn stop(&self) {
        post_stop(&self.desk);
    }

    /// Resolves once the desk loop has exited.
    pub async fn closed(&self) {
        self.desk.closed().await
    }

    fn stopped(&self) -> WorkerError {
        WorkerError::Stopped {
            key: self.key.to_string(),
        }
    }
}

/// Queue `Stop` behind whatever is already on the desk without blocking.
pub(crate) fn post_stop(desk: &mpsc::Sender<DeskCommand>) {
    match desk.try_send(DeskCommand::Stop) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(_)) => {
            let desk = desk.clone();
            tokio::spawn(async move {
                let _ = desk.send(DeskCommand::Stop).await;
            });
        }
    }
}
