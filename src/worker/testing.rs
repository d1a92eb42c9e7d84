//! Scripted protocol doubles shared by the worker, registry and router tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::account::WorkerDeps;
use crate::bus::{BrokerOrder, LocalBus, MessageBus};
use crate::config::WorkerConfig;
use crate::error::{ApiError, BrokerError};
use crate::identity::{Credentials, IdentityKey, RemoteIdentity};
use crate::protocol::{
    Broker, DeliveryOutcome, ErrorClass, InboundEvent, OutboundPayload, Protocol,
    ProtocolSession, RemoteApi, SendReceipt,
};
use crate::store::{Database, LibSqlBackend};

pub const MOCK_PROTOCOL: &str = "mock";
pub const RATE_LIMITED: i64 = 88;
pub const REVOKED: i64 = 89;

pub fn event(id: &str, sender_id: &str) -> InboundEvent {
    InboundEvent {
        id: id.to_string(),
        sender_id: sender_id.to_string(),
        recipient_id: "1".to_string(),
        sender_name: None,
        recipient_name: None,
        text: format!("message {id}"),
        created_at: Utc::now(),
        raw: serde_json::Value::Null,
    }
}

#[derive(Default)]
pub struct ScriptedApi {
    pub fetches: Mutex<VecDeque<Result<Vec<InboundEvent>, ApiError>>>,
    pub names: HashMap<u64, String>,
    pub handles: HashMap<String, String>,
    pub reject_send: Option<ApiError>,
    pub fetch_delay: Option<Duration>,
    pub lookups: AtomicUsize,
    pub sent: Mutex<Vec<OutboundPayload>>,
}

impl ScriptedApi {
    pub fn script(&self, result: Result<Vec<InboundEvent>, ApiError>) {
        self.fetches.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn fetch_events(&self, _count: usize) -> Result<Vec<InboundEvent>, ApiError> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        self.fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn lookup_display_name(&self, peer_id: u64) -> Result<Option<String>, ApiError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.names.get(&peer_id).cloned())
    }

    async fn resolve_handle(&self, handle: &str) -> Result<String, ApiError> {
        self.handles
            .get(handle)
            .cloned()
            .ok_or_else(|| ApiError::with_code(50, "User not found."))
    }

    async fn send(&self, payload: &OutboundPayload) -> Result<SendReceipt, ApiError> {
        if let Some(ref err) = self.reject_send {
            return Err(err.clone());
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(SendReceipt {
            id: "sent-1".into(),
            raw: serde_json::Value::Null,
        })
    }

    fn classify(&self, error: &ApiError) -> ErrorClass {
        match error.code {
            Some(RATE_LIMITED) => ErrorClass::RateLimited,
            Some(REVOKED) => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }
}

#[derive(Default)]
pub struct RecordingBroker {
    pub failing: HashSet<String>,
    pub build_delay: Option<Duration>,
    pub canonicalized: Mutex<Vec<InboundEvent>>,
    pub outcomes: Mutex<Vec<DeliveryOutcome>>,
    pub shutdowns: AtomicUsize,
}

impl RecordingBroker {
    pub fn canonicalized_ids(&self) -> Vec<String> {
        self.canonicalized
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.id.clone())
            .collect()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn build_outbound(&self, order: &BrokerOrder) -> Result<OutboundPayload, BrokerError> {
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        let payload = order
            .payload
            .clone()
            .ok_or_else(|| BrokerError::InvalidOrder("missing payload".into()))?;
        let to = payload["to"]
            .as_str()
            .ok_or_else(|| BrokerError::InvalidOrder("missing recipient".into()))?
            .to_string();
        Ok(OutboundPayload {
            recipient_handle: to,
            recipient_id: None,
            text: payload["body"].as_str().unwrap_or_default().to_string(),
            message_id: order.message_id,
            raw: payload,
        })
    }

    async fn finalize_outbound(&self, outcome: &DeliveryOutcome) -> Result<(), BrokerError> {
        self.outcomes.lock().unwrap().push(outcome.clone());
        Ok(())
    }

    async fn canonicalize_inbound(&self, event: &InboundEvent) -> Result<(), BrokerError> {
        if self.failing.contains(&event.id) {
            return Err(BrokerError::Canonicalize {
                event_id: event.id.clone(),
                reason: "scripted failure".into(),
            });
        }
        self.canonicalized.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out the same session to every identity.
pub struct FixedProtocol {
    pub session: ProtocolSession,
    pub connects: AtomicUsize,
    /// Extra connect latency per remote identity.
    pub connect_delays: Mutex<HashMap<Uuid, Duration>>,
}

#[async_trait]
impl Protocol for FixedProtocol {
    fn name(&self) -> &str {
        MOCK_PROTOCOL
    }

    async fn connect(&self, identity: &RemoteIdentity) -> Result<ProtocolSession, ApiError> {
        let delay = self.connect_delays.lock().unwrap().get(&identity.remote_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.session.clone())
    }
}

pub struct Fixture {
    pub deps: WorkerDeps,
    pub bus: Arc<LocalBus>,
    pub api: Arc<ScriptedApi>,
    pub broker: Arc<RecordingBroker>,
    pub protocol: Arc<FixedProtocol>,
}

impl Fixture {
    pub async fn new(api: ScriptedApi, broker: RecordingBroker) -> Self {
        let api = Arc::new(api);
        let broker = Arc::new(broker);
        let protocol = Arc::new(FixedProtocol {
            session: ProtocolSession {
                broker: broker.clone(),
                api: api.clone(),
            },
            connects: AtomicUsize::new(0),
            connect_delays: Mutex::new(HashMap::new()),
        });
        let bus = Arc::new(LocalBus::new());
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let deps = WorkerDeps {
            store,
            bus: bus.clone() as Arc<dyn MessageBus>,
            protocol: protocol.clone(),
            config: WorkerConfig {
                broker_timeout: Duration::from_millis(200),
                ..WorkerConfig::default()
            },
        };
        Self {
            deps,
            bus,
            api,
            broker,
            protocol,
        }
    }

    /// Store an identity with the given sync-state entries.
    pub async fn identity(&self, infos: &[(&str, &str)]) -> IdentityKey {
        let identity = RemoteIdentity {
            user_id: Uuid::new_v4(),
            remote_id: Uuid::new_v4(),
            protocol: MOCK_PROTOCOL.into(),
            identifier: "@alice".into(),
            credentials: Some(Credentials::new("token", "secret")),
            infos: infos
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.deps.store.upsert_identity(&identity).await.unwrap();
        identity.key()
    }

    pub async fn sync_state(&self, key: IdentityKey) -> HashMap<String, String> {
        self.deps
            .store
            .retrieve_sync_state(key.user_id, key.remote_id)
            .await
            .unwrap()
    }
}
