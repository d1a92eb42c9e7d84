//! Bus envelopes: broker orders and delivery acks.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;
use crate::identity::IdentityKey;

/// Order name carried in the `order` field of a bus envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    AddWorker,
    RemoveWorker,
    ReloadWorker,
    Sync,
    Deliver,
    UpdateInterval,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AddWorker => "add_worker",
            Self::RemoveWorker => "remove_worker",
            Self::ReloadWorker => "reload_worker",
            Self::Sync => "sync",
            Self::Deliver => "deliver",
            Self::UpdateInterval => "update_interval",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Command envelope exchanged over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order: OrderKind,
    pub user_id: Uuid,
    pub remote_id: Uuid,
    #[serde(default)]
    pub protocol: String,
    /// New poll interval in seconds, as a string (`update_interval` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    /// Canonical message to deliver (`deliver` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    /// Protocol-specific send payload (`deliver` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl BrokerOrder {
    pub fn new(order: OrderKind, key: IdentityKey, protocol: impl Into<String>) -> Self {
        Self {
            order,
            user_id: key.user_id,
            remote_id: key.remote_id,
            protocol: protocol.into(),
            poll_interval: None,
            message_id: None,
            payload: None,
        }
    }

    /// Build the notification telling the scheduler to poll at a new pace.
    pub fn update_interval(key: IdentityKey, protocol: impl Into<String>, secs: u64) -> Self {
        Self {
            poll_interval: Some(secs.to_string()),
            ..Self::new(OrderKind::UpdateInterval, key, protocol)
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(self.user_id, self.remote_id)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Outcome of an outbound delivery, sent back to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub err: bool,
    pub response: String,
}

impl DeliveryAck {
    pub fn ok() -> Self {
        Self {
            err: false,
            response: "OK".to_string(),
        }
    }

    pub fn error(response: impl Into<String>) -> Self {
        Self {
            err: true,
            response: response.into(),
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }
}
