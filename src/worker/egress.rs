//! Outbound send protocol and the worker's egress loop.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::command::{DeskCommand, EgressRequest};
use super::handle::post_stop;
use crate::bus::{BrokerOrder, DeliveryAck};
use crate::error::{ApiError, WorkerError};
use crate::identity::IdentityKey;
use crate::protocol::{DeliveryOutcome, OutboundPayload, ProtocolSession, SendReceipt};

/// Deliver one outbound order.
///
/// Both broker round-trips are bounded by `broker_timeout`. Success is only
/// reported once the broker has finalized the accepted send.
pub async fn send_outbound(
    session: &ProtocolSession,
    order: &BrokerOrder,
    broker_timeout: Duration,
) -> Result<SendReceipt, WorkerError> {
    let mut payload = bounded(
        broker_timeout,
        "build_outbound",
        session.broker.build_outbound(order),
    )
    .await?;

    if payload.recipient_id.is_none() {
        match session.api.resolve_handle(&payload.recipient_handle).await {
            Ok(id) => payload.recipient_id = Some(id),
            Err(e) => {
                report_failure(session, payload, &e, broker_timeout).await;
                return Err(e.into());
            }
        }
    }

    match session.api.send(&payload).await {
        Ok(receipt) => {
            let outcome = DeliveryOutcome::delivered(payload, receipt.clone());
            bounded(
                broker_timeout,
                "finalize_outbound",
                session.broker.finalize_outbound(&outcome),
            )
            .await?;
            Ok(receipt)
        }
        Err(e) => {
            report_failure(session, payload, &e, broker_timeout).await;
            Err(e.into())
        }
    }
}

/// Let the broker book a failed send. Its own failure is only logged.
async fn report_failure(
    session: &ProtocolSession,
    payload: OutboundPayload,
    error: &ApiError,
    broker_timeout: Duration,
) {
    let outcome = DeliveryOutcome::failed(payload, error.to_string());
    if let Err(e) = bounded(
        broker_timeout,
        "finalize_outbound",
        session.broker.finalize_outbound(&outcome),
    )
    .await
    {
        warn!(error = %e, "Broker could not record failed delivery");
    }
}

async fn bounded<T, E>(
    budget: Duration,
    stage: &'static str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, WorkerError>
where
    WorkerError: From<E>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result.map_err(WorkerError::from),
        Err(_) => Err(WorkerError::BrokerTimeout {
            stage,
            timeout: budget,
        }),
    }
}

/// Consumer side of a worker's egress channel.
pub(crate) struct Egress {
    key: IdentityKey,
    session: ProtocolSession,
    broker_timeout: Duration,
    desk: mpsc::Sender<DeskCommand>,
}

impl Egress {
    pub(crate) fn new(
        key: IdentityKey,
        session: ProtocolSession,
        broker_timeout: Duration,
        desk: mpsc::Sender<DeskCommand>,
    ) -> Self {
        Self {
            key,
            session,
            broker_timeout,
            desk,
        }
    }

    /// Serve requests one at a time until the channel closes, a halt is
    /// broadcast, or the desk loop exits.
    pub(crate) async fn run(
        self,
        mut requests: mpsc::Receiver<EgressRequest>,
        mut halt: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.serve(request).await,
                    None => {
                        debug!(remote_id = %self.key.remote_id, "Egress channel closed");
                        post_stop(&self.desk);
                        break;
                    }
                },
                _ = halt.recv() => {
                    debug!(remote_id = %self.key.remote_id, "Halt received");
                    post_stop(&self.desk);
                    break;
                }
                _ = self.desk.closed() => break,
            }
        }
    }

    async fn serve(&self, request: EgressRequest) {
        let EgressRequest { order, ack } = request;
        let reply = match send_outbound(&self.session, &order, self.broker_timeout).await {
            Ok(receipt) => {
                info!(
                    remote_id = %self.key.remote_id,
                    message_id = ?order.message_id,
                    receipt = %receipt.id,
                    "Outbound message delivered"
                );
                DeliveryAck::ok()
            }
            Err(e) => {
                warn!(
                    remote_id = %self.key.remote_id,
                    message_id = ?order.message_id,
                    error = %e,
                    "Outbound delivery failed"
                );
                DeliveryAck::error(e.to_string())
            }
        };
        if ack.send(reply).is_err() {
            debug!(remote_id = %self.key.remote_id, "Delivery ack no longer awaited");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::bus::OrderKind;
    use crate::worker::testing::{RecordingBroker, ScriptedApi};

    fn session(api: ScriptedApi, broker: RecordingBroker) -> (ProtocolSession, Arc<ScriptedApi>, Arc<RecordingBroker>) {
        let api = Arc::new(api);
        let broker = Arc::new(broker);
        let session = ProtocolSession {
            broker: broker.clone(),
            api: api.clone(),
        };
        (session, api, broker)
    }

    fn order(to: &str) -> BrokerOrder {
        let key = IdentityKey::new(Uuid::new_v4(), Uuid::new_v4());
        BrokerOrder::new(OrderKind::Deliver, key, "mock")
            .with_payload(serde_json::json!({"to": to, "body": "hello"}))
    }

    fn resolving_api() -> ScriptedApi {
        ScriptedApi {
            handles: HashMap::from([("@bob".to_string(), "2".to_string())]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn accepted_send_is_finalized() {
        let (session, api, broker) = session(resolving_api(), RecordingBroker::default());
        let receipt = send_outbound(&session, &order("@bob"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(receipt.id, "sent-1");
        let sent = api.sent.lock().unwrap().clone();
        assert_eq!(sent[0].recipient_id.as_deref(), Some("2"));
        let outcomes = broker.outcomes.lock().unwrap().clone();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_delivered());
    }

    #[tokio::test]
    async fn unresolvable_recipient_fails_the_send() {
        let (session, api, broker) = session(resolving_api(), RecordingBroker::default());
        let err = send_outbound(&session, &order("@nobody"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Api(ref e) if e.code == Some(50)));
        assert!(api.sent.lock().unwrap().is_empty());
        let outcomes = broker.outcomes.lock().unwrap().clone();
        assert!(!outcomes[0].is_delivered());
    }

    #[tokio::test]
    async fn provider_rejection_is_reported_to_broker() {
        let api = ScriptedApi {
            reject_send: Some(ApiError::with_code(150, "Recipient does not accept messages")),
            ..resolving_api()
        };
        let (session, _api, broker) = session(api, RecordingBroker::default());
        let err = send_outbound(&session, &order("@bob"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("does not accept messages"));
        let outcomes = broker.outcomes.lock().unwrap().clone();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].error.as_deref().unwrap().contains("code 150"));
    }

    #[tokio::test]
    async fn slow_broker_times_out() {
        let broker = RecordingBroker {
            build_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let (session, api, _broker) = session(resolving_api(), broker);
        let err = send_outbound(&session, &order("@bob"), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WorkerError::BrokerTimeout {
                stage: "build_outbound",
                ..
            }
        ));
        assert!(api.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn egress_loop_acks_and_stops_when_channel_closes() {
        let (session, _api, _broker) = session(resolving_api(), RecordingBroker::default());
        let (desk_tx, mut desk_rx) = mpsc::channel(3);
        let (egress_tx, egress_rx) = mpsc::channel(1);
        let (_halt_tx, halt_rx) = broadcast::channel(1);
        let egress = Egress::new(
            IdentityKey::new(Uuid::new_v4(), Uuid::new_v4()),
            session,
            Duration::from_secs(1),
            desk_tx,
        );
        let task = tokio::spawn(egress.run(egress_rx, halt_rx));

        let (request, ack) = EgressRequest::new(order("@nobody"));
        egress_tx.send(request).await.unwrap();
        let ack = ack.await.unwrap();
        assert!(ack.err);
        assert!(ack.response.contains("User not found"));

        drop(egress_tx);
        assert_eq!(desk_rx.recv().await, Some(DeskCommand::Stop));
        task.await.unwrap();
    }
}
