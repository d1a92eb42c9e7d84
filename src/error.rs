//! Error types for the identity relay.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Account worker errors: construction failures, backpressure and timeouts.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Remote identity {remote_id} not found for user {user_id}")]
    IdentityNotFound { user_id: String, remote_id: String },

    #[error("Remote identity {remote_id} (user {user_id}) has no credentials")]
    CredentialsMissing { user_id: String, remote_id: String },

    #[error("No protocol registered for {protocol}")]
    ProtocolUnavailable { protocol: String },

    #[error("Failed to connect {protocol} client: {reason}")]
    Connect { protocol: String, reason: String },

    #[error("Broker timed out after {timeout:?} during {stage}")]
    BrokerTimeout {
        stage: &'static str,
        timeout: Duration,
    },

    #[error("Worker desk for {key} is full (waited {timeout:?})")]
    DeskFull { key: String, timeout: Duration },

    #[error("Worker egress for {key} is full (waited {timeout:?})")]
    EgressFull { key: String, timeout: Duration },

    #[error("Timed out after {timeout:?} waiting for delivery ack")]
    AckTimeout { timeout: Duration },

    #[error("Worker {key} did not stop within {timeout:?}")]
    StopTimeout { key: String, timeout: Duration },

    #[error("Worker {key} is stopped")]
    Stopped { key: String },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Remote API error: {0}")]
    Api(#[from] ApiError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Message bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("No reply on {subject} within {timeout:?}")]
    RequestTimeout { subject: String, timeout: Duration },

    #[error("Bus is closed")]
    Closed,
}

/// Protocol broker errors (wire codec and persistence side).
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid outbound order: {0}")]
    InvalidOrder(String),

    #[error("Failed to canonicalize inbound event {event_id}: {reason}")]
    Canonicalize { event_id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Error returned by a provider's remote API.
///
/// `code` carries the provider's own numeric error code when there is one;
/// interpretation is left to `RemoteApi::classify`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}{}", code_suffix(.code))]
pub struct ApiError {
    pub code: Option<i64>,
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

fn code_suffix(code: &Option<i64>) -> String {
    code.map(|c| format!(" (code {c})")).unwrap_or_default()
}
