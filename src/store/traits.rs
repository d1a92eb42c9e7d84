//! `Database` trait — the persistence contract the relay depends on.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::RemoteIdentity;

/// Direction of a stored message relative to the identity's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "outbound" => Self::Outbound,
            _ => Self::Inbound,
        }
    }
}

/// A message persisted by a protocol broker.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub remote_id: Uuid,
    /// Provider-native message id.
    pub external_id: String,
    pub protocol: String,
    pub direction: MessageDirection,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
    pub metadata: Option<String>,
}

/// Backend-agnostic persistence for identities, their sync state and messages.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Identities ──────────────────────────────────────────────────

    /// Load a remote identity, or `None` if the user has no such identity.
    async fn retrieve_identity(
        &self,
        user_id: Uuid,
        remote_id: Uuid,
    ) -> Result<Option<RemoteIdentity>, DatabaseError>;

    /// Create or replace a remote identity.
    async fn upsert_identity(&self, identity: &RemoteIdentity) -> Result<(), DatabaseError>;

    // ── Sync state ──────────────────────────────────────────────────

    /// Raw sync-state map of an identity.
    async fn retrieve_sync_state(
        &self,
        user_id: Uuid,
        remote_id: Uuid,
    ) -> Result<HashMap<String, String>, DatabaseError>;

    /// Replace the sync-state map of an identity.
    async fn update_sync_state(
        &self,
        user_id: Uuid,
        remote_id: Uuid,
        state: &HashMap<String, String>,
    ) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message. Returns `false` if it was already stored.
    async fn insert_message(&self, message: &StoredMessage) -> Result<bool, DatabaseError>;

    /// Look up a message by its provider-native id within one identity.
    async fn get_message_by_external_id(
        &self,
        user_id: Uuid,
        remote_id: Uuid,
        external_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Messages of one identity in the order they were received, oldest first.
    async fn list_messages(
        &self,
        user_id: Uuid,
        remote_id: Uuid,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;
}
