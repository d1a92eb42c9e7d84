//! Protocol seams: the remote API client and the broker that converts
//! between provider payloads and the platform's canonical messages.
//!
//! A `Protocol` connects both halves for one identity's credentials. The
//! account worker only ever talks to these traits.

pub mod loopback;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bus::BrokerOrder;
use crate::error::{ApiError, BrokerError};
use crate::identity::RemoteIdentity;

pub use loopback::{LoopbackNetwork, LoopbackProtocol};

/// How the worker should react to a remote API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller must slow down; back off and retry later.
    RateLimited,
    /// Worth retrying on the next cycle.
    Transient,
    /// The session cannot recover (revoked or invalid credentials).
    Fatal,
}

/// One event as returned by a provider's listing endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Provider-native id; ordering follows `worker::cursor::compare_event_ids`.
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub sender_name: Option<String>,
    pub recipient_name: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// Provider-specific payload ready to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPayload {
    /// Handle as written by the user, e.g. `@bob`.
    pub recipient_handle: String,
    /// Provider-internal recipient id, once resolved.
    pub recipient_id: Option<String>,
    pub text: String,
    /// Canonical message this payload was built from.
    pub message_id: Option<Uuid>,
    pub raw: serde_json::Value,
}

/// Provider acknowledgement of an accepted send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub id: String,
    pub raw: serde_json::Value,
}

/// What happened to an outbound payload, reported back to the broker.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub payload: OutboundPayload,
    pub receipt: Option<SendReceipt>,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered(payload: OutboundPayload, receipt: SendReceipt) -> Self {
        Self {
            payload,
            receipt: Some(receipt),
            error: None,
        }
    }

    pub fn failed(payload: OutboundPayload, error: impl Into<String>) -> Self {
        Self {
            payload,
            receipt: None,
            error: Some(error.into()),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.receipt.is_some() && self.error.is_none()
    }
}

/// Raw remote API calls for one authenticated account.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Most recent events, up to `count`, in whatever order the provider uses.
    async fn fetch_events(&self, count: usize) -> Result<Vec<InboundEvent>, ApiError>;

    /// Display name of a numeric peer id, if the provider knows it.
    async fn lookup_display_name(&self, peer_id: u64) -> Result<Option<String>, ApiError>;

    /// Map a user-facing handle to the provider-internal recipient id.
    async fn resolve_handle(&self, handle: &str) -> Result<String, ApiError>;

    /// Submit an outbound payload.
    async fn send(&self, payload: &OutboundPayload) -> Result<SendReceipt, ApiError>;

    /// Classify a provider error for backoff decisions.
    fn classify(&self, error: &ApiError) -> ErrorClass;
}

/// Wire-format codec and persistence for one identity.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Validate an outbound order and build the provider payload.
    async fn build_outbound(&self, order: &BrokerOrder) -> Result<OutboundPayload, BrokerError>;

    /// Record the outcome of a send attempt.
    async fn finalize_outbound(&self, outcome: &DeliveryOutcome) -> Result<(), BrokerError>;

    /// Convert an inbound event to a canonical message and persist it.
    async fn canonicalize_inbound(&self, event: &InboundEvent) -> Result<(), BrokerError>;

    /// Release resources held for this identity.
    async fn shutdown(&self) {}
}

/// Authenticated broker + API pair bound to one identity.
#[derive(Clone)]
pub struct ProtocolSession {
    pub broker: Arc<dyn Broker>,
    pub api: Arc<dyn RemoteApi>,
}

/// Factory for protocol sessions.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Protocol name as stored on remote identities.
    fn name(&self) -> &str;

    /// Build an authenticated session from the identity's credentials.
    async fn connect(&self, identity: &RemoteIdentity) -> Result<ProtocolSession, ApiError>;
}
