//! Loopback protocol — an in-memory direct-message network.
//!
//! Accounts live in a shared `LoopbackNetwork`; sending a message appends an
//! event to the recipient's inbox, which the recipient's worker picks up on its
//! next poll. Used by the binary for local runs and by tests, with hooks to
//! inject provider errors.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Broker, DeliveryOutcome, ErrorClass, InboundEvent, OutboundPayload, Protocol,
    ProtocolSession, RemoteApi, SendReceipt,
};
use crate::bus::BrokerOrder;
use crate::error::{ApiError, BrokerError};
use crate::identity::{IdentityKey, RemoteIdentity};
use crate::store::{Database, MessageDirection, StoredMessage};

pub const PROTOCOL_NAME: &str = "loopback";

/// Provider error codes understood by `classify`.
pub const USER_NOT_FOUND_CODE: i64 = 50;
pub const RATE_LIMIT_CODE: i64 = 88;
pub const INVALID_TOKEN_CODE: i64 = 89;

#[derive(Debug, Clone)]
struct Account {
    handle: String,
    display_name: String,
}

#[derive(Default)]
struct NetworkState {
    accounts: HashMap<u64, Account>,
    tokens: HashMap<String, u64>,
    inboxes: HashMap<u64, Vec<InboundEvent>>,
    next_event_id: u64,
    fetch_failures: HashMap<u64, VecDeque<ApiError>>,
    send_failures: HashMap<u64, VecDeque<ApiError>>,
    name_lookups: usize,
}

/// Shared state of the loopback network.
#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<NetworkState>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an account reachable by `handle` and authenticated by `token`.
    pub fn register_account(&self, id: u64, handle: &str, display_name: &str, token: &str) {
        let mut state = self.state();
        state.accounts.insert(
            id,
            Account {
                handle: handle.trim_start_matches('@').to_string(),
                display_name: display_name.to_string(),
            },
        );
        state.tokens.insert(token.to_string(), id);
    }

    /// Send `text` from one account to another. Returns the new event id.
    pub fn post(&self, from: u64, to: u64, text: &str) -> String {
        let mut state = self.state();
        state.next_event_id += 1;
        let id = state.next_event_id.to_string();
        let event = InboundEvent {
            id: id.clone(),
            sender_id: from.to_string(),
            recipient_id: to.to_string(),
            sender_name: None,
            recipient_name: None,
            text: text.to_string(),
            created_at: Utc::now(),
            raw: serde_json::json!({ "id": id, "type": "message_create" }),
        };
        state.inboxes.entry(to).or_default().push(event);
        id
    }

    /// Append a prebuilt event to an account's inbox.
    pub fn push_event(&self, to: u64, event: InboundEvent) {
        self.state().inboxes.entry(to).or_default().push(event);
    }

    /// Make the next fetch for `account` fail with `error`.
    pub fn fail_next_fetch(&self, account: u64, error: ApiError) {
        self.state()
            .fetch_failures
            .entry(account)
            .or_default()
            .push_back(error);
    }

    /// Make the next send from `account` fail with `error`.
    pub fn fail_next_send(&self, account: u64, error: ApiError) {
        self.state()
            .send_failures
            .entry(account)
            .or_default()
            .push_back(error);
    }

    /// Events currently in an account's inbox, oldest first.
    pub fn inbox(&self, account: u64) -> Vec<InboundEvent> {
        self.state().inboxes.get(&account).cloned().unwrap_or_default()
    }

    /// Number of display-name lookups served so far.
    pub fn name_lookups(&self) -> usize {
        self.state().name_lookups
    }
}

/// Remote API half, bound to one account.
pub struct LoopbackApi {
    network: Arc<LoopbackNetwork>,
    account: u64,
}

#[async_trait]
impl RemoteApi for LoopbackApi {
    async fn fetch_events(&self, count: usize) -> Result<Vec<InboundEvent>, ApiError> {
        let mut state = self.network.state();
        if let Some(err) = state
            .fetch_failures
            .get_mut(&self.account)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        // Newest first, like most provider listing endpoints.
        Ok(state
            .inboxes
            .get(&self.account)
            .map(|events| events.iter().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn lookup_display_name(&self, peer_id: u64) -> Result<Option<String>, ApiError> {
        let mut state = self.network.state();
        state.name_lookups += 1;
        Ok(state.accounts.get(&peer_id).map(|a| a.display_name.clone()))
    }

    async fn resolve_handle(&self, handle: &str) -> Result<String, ApiError> {
        let wanted = handle.trim_start_matches('@');
        self.network
            .state()
            .accounts
            .iter()
            .find(|(_, account)| account.handle.eq_ignore_ascii_case(wanted))
            .map(|(id, _)| id.to_string())
            .ok_or_else(|| ApiError::with_code(USER_NOT_FOUND_CODE, "User not found."))
    }

    async fn send(&self, payload: &OutboundPayload) -> Result<SendReceipt, ApiError> {
        {
            let mut state = self.network.state();
            if let Some(err) = state
                .send_failures
                .get_mut(&self.account)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
        }

        let recipient: u64 = payload
            .recipient_id
            .as_deref()
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| ApiError::new("recipient id missing or malformed"))?;

        if !self.network.state().accounts.contains_key(&recipient) {
            return Err(ApiError::with_code(USER_NOT_FOUND_CODE, "User not found."));
        }

        let id = self.network.post(self.account, recipient, &payload.text);
        Ok(SendReceipt {
            raw: serde_json::json!({ "id": id, "recipient_id": recipient }),
            id,
        })
    }

    fn classify(&self, error: &ApiError) -> ErrorClass {
        match error.code {
            Some(RATE_LIMIT_CODE) | Some(429) => ErrorClass::RateLimited,
            Some(INVALID_TOKEN_CODE) | Some(401) => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }
}

/// Broker half: stores inbound events and delivered messages.
pub struct LoopbackBroker {
    key: IdentityKey,
    owner: String,
    store: Arc<dyn Database>,
}

impl LoopbackBroker {
    fn stored(&self, direction: MessageDirection) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            user_id: self.key.user_id,
            remote_id: self.key.remote_id,
            external_id: String::new(),
            protocol: PROTOCOL_NAME.to_string(),
            direction,
            sender: String::new(),
            recipient: String::new(),
            content: String::new(),
            received_at: Utc::now(),
            metadata: None,
        }
    }
}

#[async_trait]
impl Broker for LoopbackBroker {
    async fn build_outbound(&self, order: &BrokerOrder) -> Result<OutboundPayload, BrokerError> {
        let payload = order
            .payload
            .as_ref()
            .ok_or_else(|| BrokerError::InvalidOrder("deliver order has no payload".into()))?;

        let field = |name: &str| payload.get(name).and_then(|v| v.as_str());
        let to = field("to")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BrokerError::InvalidOrder("payload.to is required".into()))?;
        let body = field("body")
            .ok_or_else(|| BrokerError::InvalidOrder("payload.body is required".into()))?;

        Ok(OutboundPayload {
            recipient_handle: to.to_string(),
            recipient_id: field("recipient_id").map(str::to_string),
            text: body.to_string(),
            message_id: order.message_id,
            raw: payload.clone(),
        })
    }

    async fn finalize_outbound(&self, outcome: &DeliveryOutcome) -> Result<(), BrokerError> {
        let Some(ref receipt) = outcome.receipt else {
            warn!(
                remote_id = %self.key.remote_id,
                recipient = %outcome.payload.recipient_handle,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Outbound message was not delivered"
            );
            return Ok(());
        };

        let message = StoredMessage {
            external_id: receipt.id.clone(),
            sender: self.owner.clone(),
            recipient: outcome.payload.recipient_handle.clone(),
            content: outcome.payload.text.clone(),
            metadata: outcome
                .payload
                .message_id
                .map(|id| serde_json::json!({ "message_id": id }).to_string()),
            ..self.stored(MessageDirection::Outbound)
        };
        self.store.insert_message(&message).await?;
        Ok(())
    }

    async fn canonicalize_inbound(&self, event: &InboundEvent) -> Result<(), BrokerError> {
        if event.text.is_empty() {
            return Err(BrokerError::Canonicalize {
                event_id: event.id.clone(),
                reason: "empty message".into(),
            });
        }

        let message = StoredMessage {
            external_id: event.id.clone(),
            sender: event
                .sender_name
                .clone()
                .unwrap_or_else(|| event.sender_id.clone()),
            recipient: event
                .recipient_name
                .clone()
                .unwrap_or_else(|| event.recipient_id.clone()),
            content: event.text.clone(),
            received_at: event.created_at,
            metadata: Some(
                serde_json::json!({
                    "sender_id": event.sender_id,
                    "recipient_id": event.recipient_id,
                })
                .to_string(),
            ),
            ..self.stored(MessageDirection::Inbound)
        };

        if !self.store.insert_message(&message).await? {
            debug!(event_id = %event.id, "Event already stored");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        debug!(remote_id = %self.key.remote_id, "Loopback broker released");
    }
}

/// Connects identities to the loopback network.
pub struct LoopbackProtocol {
    network: Arc<LoopbackNetwork>,
    store: Arc<dyn Database>,
}

impl LoopbackProtocol {
    pub fn new(network: Arc<LoopbackNetwork>, store: Arc<dyn Database>) -> Self {
        Self { network, store }
    }
}

#[async_trait]
impl Protocol for LoopbackProtocol {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    async fn connect(&self, identity: &RemoteIdentity) -> Result<ProtocolSession, ApiError> {
        let credentials = identity
            .credentials
            .as_ref()
            .ok_or_else(|| ApiError::with_code(INVALID_TOKEN_CODE, "No credentials"))?;

        let account = self
            .network
            .state()
            .tokens
            .get(credentials.token.expose_secret())
            .copied()
            .ok_or_else(|| ApiError::with_code(INVALID_TOKEN_CODE, "Invalid or expired token"))?;

        Ok(ProtocolSession {
            broker: Arc::new(LoopbackBroker {
                key: identity.key(),
                owner: identity.identifier.clone(),
                store: Arc::clone(&self.store),
            }),
            api: Arc::new(LoopbackApi {
                network: Arc::clone(&self.network),
                account,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::OrderKind;
    use crate::identity::Credentials;
    use crate::store::LibSqlBackend;

    async fn setup() -> (Arc<LoopbackNetwork>, Arc<dyn Database>, RemoteIdentity) {
        let network = LoopbackNetwork::new();
        network.register_account(1, "@alice", "Alice", "alice-token");
        network.register_account(2, "@bob", "Bob", "bob-token");
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let identity = RemoteIdentity {
            user_id: Uuid::new_v4(),
            remote_id: Uuid::new_v4(),
            protocol: PROTOCOL_NAME.into(),
            identifier: "@alice".into(),
            credentials: Some(Credentials::new("alice-token", "s")),
            infos: HashMap::new(),
        };
        (network, store, identity)
    }

    #[tokio::test]
    async fn connect_rejects_unknown_token() {
        let (network, store, mut identity) = setup().await;
        identity.credentials = Some(Credentials::new("nope", "s"));
        let protocol = LoopbackProtocol::new(network, store);
        let err = protocol.connect(&identity).await.err().unwrap();
        assert_eq!(err.code, Some(INVALID_TOKEN_CODE));
    }

    #[tokio::test]
    async fn fetch_returns_newest_first_and_honours_count() {
        let (network, store, identity) = setup().await;
        network.post(2, 1, "one");
        network.post(2, 1, "two");
        network.post(2, 1, "three");
        let session = LoopbackProtocol::new(Arc::clone(&network), store)
            .connect(&identity)
            .await
            .unwrap();

        let events = session.api.fetch_events(2).await.unwrap();
        let texts: Vec<_> = events.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["three", "two"]);
    }

    #[tokio::test]
    async fn injected_fetch_error_is_returned_once() {
        let (network, store, identity) = setup().await;
        network.fail_next_fetch(1, ApiError::with_code(RATE_LIMIT_CODE, "Rate limit exceeded"));
        let session = LoopbackProtocol::new(Arc::clone(&network), store)
            .connect(&identity)
            .await
            .unwrap();

        let err = session.api.fetch_events(50).await.unwrap_err();
        assert_eq!(session.api.classify(&err), ErrorClass::RateLimited);
        assert!(session.api.fetch_events(50).await.is_ok());
    }

    #[tokio::test]
    async fn classify_codes() {
        let (network, store, identity) = setup().await;
        let session = LoopbackProtocol::new(network, store)
            .connect(&identity)
            .await
            .unwrap();
        let api = session.api;
        assert_eq!(api.classify(&ApiError::with_code(429, "slow")), ErrorClass::RateLimited);
        assert_eq!(api.classify(&ApiError::with_code(INVALID_TOKEN_CODE, "bad")), ErrorClass::Fatal);
        assert_eq!(api.classify(&ApiError::new("socket closed")), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn resolve_and_send_reach_recipient_inbox() {
        let (network, store, identity) = setup().await;
        let session = LoopbackProtocol::new(Arc::clone(&network), store)
            .connect(&identity)
            .await
            .unwrap();

        let bob = session.api.resolve_handle("@Bob").await.unwrap();
        assert_eq!(bob, "2");
        let err = session.api.resolve_handle("@nobody").await.unwrap_err();
        assert_eq!(err.code, Some(USER_NOT_FOUND_CODE));

        let payload = OutboundPayload {
            recipient_handle: "@bob".into(),
            recipient_id: Some(bob),
            text: "hey".into(),
            message_id: None,
            raw: serde_json::Value::Null,
        };
        let receipt = session.api.send(&payload).await.unwrap();
        let inbox = network.inbox(2);
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, receipt.id);
        assert_eq!(inbox[0].sender_id, "1");
    }

    #[tokio::test]
    async fn build_outbound_validates_payload() {
        let (network, store, identity) = setup().await;
        let session = LoopbackProtocol::new(network, store)
            .connect(&identity)
            .await
            .unwrap();

        let order = BrokerOrder::new(OrderKind::Deliver, identity.key(), PROTOCOL_NAME);
        assert!(matches!(
            session.broker.build_outbound(&order).await,
            Err(BrokerError::InvalidOrder(_))
        ));

        let order = order.with_payload(serde_json::json!({"to": "@bob", "body": "hi"}));
        let payload = session.broker.build_outbound(&order).await.unwrap();
        assert_eq!(payload.recipient_handle, "@bob");
        assert_eq!(payload.text, "hi");
        assert!(payload.recipient_id.is_none());
    }

    #[tokio::test]
    async fn canonicalize_stores_message_once() {
        let (network, store, identity) = setup().await;
        let id = network.post(2, 1, "hello alice");
        let session = LoopbackProtocol::new(Arc::clone(&network), Arc::clone(&store))
            .connect(&identity)
            .await
            .unwrap();

        let mut event = network.inbox(1).remove(0);
        event.sender_name = Some("Bob".into());
        session.broker.canonicalize_inbound(&event).await.unwrap();
        session.broker.canonicalize_inbound(&event).await.unwrap();

        let messages = store
            .list_messages(identity.user_id, identity.remote_id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].external_id, id);
        assert_eq!(messages[0].sender, "Bob");
    }
}
