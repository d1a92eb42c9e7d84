//! Bus command router.
//!
//! Two streams: management orders (`add_worker`, `remove_worker`,
//! `reload_worker`) handled in arrival order, and delivery orders (`sync`,
//! `deliver`) handled one task per message. Every wait on a worker is bounded;
//! failures become error acks whenever the message carries a reply subject.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BrokerOrder, BusMessage, DeliveryAck, MessageBus, OrderKind};
use crate::config::RouterConfig;
use crate::error::WorkerError;
use crate::worker::{DeskCommand, WorkerRegistry};

pub struct Router {
    registry: Arc<WorkerRegistry>,
    bus: Arc<dyn MessageBus>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        bus: Arc<dyn MessageBus>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Consume both streams until they close.
    pub fn spawn(
        self: Arc<Self>,
        mut management: mpsc::UnboundedReceiver<BusMessage>,
        mut delivery: mpsc::UnboundedReceiver<BusMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut management_open = true;
            let mut delivery_open = true;
            while management_open || delivery_open {
                tokio::select! {
                    message = management.recv(), if management_open => match message {
                        Some(message) => self.handle_management(&message).await,
                        None => management_open = false,
                    },
                    message = delivery.recv(), if delivery_open => match message {
                        Some(message) => {
                            let router = Arc::clone(&self);
                            tokio::spawn(async move { router.handle_delivery(&message).await });
                        }
                        None => delivery_open = false,
                    },
                }
            }
            debug!("Router streams closed");
        })
    }

    /// Handle one message from the management stream.
    pub async fn handle_management(&self, message: &BusMessage) {
        let Some(order) = decode(message) else {
            return;
        };
        let key = order.key();

        match order.order {
            OrderKind::AddWorker => {
                info!(user_id = %key.user_id, remote_id = %key.remote_id, "add_worker");
                if let Err(e) = self.registry.create(key).await {
                    warn!(
                        user_id = %key.user_id,
                        remote_id = %key.remote_id,
                        error = %e,
                        "Failed to create worker"
                    );
                }
            }
            OrderKind::RemoveWorker => {
                info!(user_id = %key.user_id, remote_id = %key.remote_id, "remove_worker");
                match self.registry.remove(key).await {
                    Ok(true) => {}
                    Ok(false) => debug!(remote_id = %key.remote_id, "No worker to remove"),
                    Err(e) => warn!(
                        user_id = %key.user_id,
                        remote_id = %key.remote_id,
                        error = %e,
                        "Failed to remove worker"
                    ),
                }
            }
            OrderKind::ReloadWorker => {
                info!(remote_id = %key.remote_id, "reload_worker (not implemented)");
            }
            other => {
                debug!(order = %other, "Ignoring order on management stream");
            }
        }
    }

    /// Handle one message from the delivery stream.
    pub async fn handle_delivery(&self, message: &BusMessage) {
        let Some(order) = decode(message) else {
            return;
        };
        let reply = message.reply.as_deref();

        match order.order {
            OrderKind::Sync => self.sync(order, reply).await,
            OrderKind::Deliver => self.deliver(order, reply).await,
            other => {
                warn!(order = %other, "Unsupported order on delivery stream");
                self.reply(reply, DeliveryAck::error("not implemented")).await;
            }
        }
    }

    async fn sync(&self, order: BrokerOrder, reply: Option<&str>) {
        let key = order.key();
        info!(user_id = %key.user_id, remote_id = %key.remote_id, "sync");

        let handle = match self.registry.get_or_create(key).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(remote_id = %key.remote_id, error = %e, "Failed to get a worker");
                self.reply_error(reply, &e).await;
                return;
            }
        };

        match handle
            .enqueue(DeskCommand::Poll, self.config.enqueue_timeout)
            .await
        {
            Ok(()) => debug!(remote_id = %key.remote_id, "Poll queued"),
            Err(e) => {
                warn!(remote_id = %key.remote_id, error = %e, "Sync order abandoned");
                self.reply_error(reply, &e).await;
            }
        }
    }

    async fn deliver(&self, order: BrokerOrder, reply: Option<&str>) {
        let key = order.key();
        let handle = match self.registry.get_or_create(key).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(remote_id = %key.remote_id, error = %e, "Failed to get a worker");
                self.reply_error(reply, &e).await;
                return;
            }
        };

        let ack = match handle.deliver(order, self.config.enqueue_timeout).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(remote_id = %key.remote_id, error = %e, "Deliver order abandoned");
                self.reply_error(reply, &e).await;
                return;
            }
        };
        info!(user_id = %key.user_id, remote_id = %key.remote_id, "Delivery handed to worker");

        let bus = Arc::clone(&self.bus);
        let reply = reply.map(str::to_string);
        let budget = self.config.ack_timeout;
        tokio::spawn(async move {
            let outcome = await_ack(ack, budget).await;
            publish_ack(bus.as_ref(), reply.as_deref(), outcome).await;
        });
    }

    async fn reply_error(&self, reply: Option<&str>, error: &WorkerError) {
        self.reply(reply, failure(error)).await;
    }

    async fn reply(&self, reply: Option<&str>, ack: DeliveryAck) {
        publish_ack(self.bus.as_ref(), reply, ack).await;
    }
}

fn decode(message: &BusMessage) -> Option<BrokerOrder> {
    match BrokerOrder::decode(&message.payload) {
        Ok(order) => Some(order),
        Err(e) => {
            error!(
                subject = %message.subject,
                error = %e,
                payload = %String::from_utf8_lossy(&message.payload),
                "Dropping undecodable bus message"
            );
            None
        }
    }
}

fn failure(error: &WorkerError) -> DeliveryAck {
    DeliveryAck::error(format!("delivery failed: {error}"))
}

async fn await_ack(ack: oneshot::Receiver<DeliveryAck>, budget: Duration) -> DeliveryAck {
    match tokio::time::timeout(budget, ack).await {
        Ok(Ok(ack)) if ack.err => DeliveryAck::error(format!("delivery failed: {}", ack.response)),
        Ok(Ok(_)) => DeliveryAck::ok(),
        Ok(Err(_)) => DeliveryAck::error("delivery failed: worker stopped before acknowledging"),
        Err(_) => failure(&WorkerError::AckTimeout { timeout: budget }),
    }
}

async fn publish_ack(bus: &dyn MessageBus, reply: Option<&str>, ack: DeliveryAck) {
    let Some(subject) = reply else {
        debug!(err = ack.err, response = %ack.response, "No reply subject, ack dropped");
        return;
    };
    match ack.encode() {
        Ok(payload) => {
            if let Err(e) = bus.publish(subject, payload).await {
                warn!(subject = %subject, error = %e, "Failed to publish ack");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode ack"),
    }
}
