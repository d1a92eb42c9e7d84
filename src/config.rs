//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Capacity of a worker's command desk.
pub const DESK_CAPACITY: usize = 3;

/// Capacity of a worker's egress channel: one outbound send in flight.
pub const EGRESS_CAPACITY: usize = 1;

/// Number of events requested from the remote API per poll cycle.
pub const POLL_PAGE_SIZE: usize = 50;

/// Default subject carrying worker management orders.
pub const DEFAULT_MANAGEMENT_SUBJECT: &str = "relay.workers";

/// Default subject carrying sync/deliver orders.
pub const DEFAULT_DELIVERY_SUBJECT: &str = "relay.dm";

/// Default subject the polling scheduler listens on for interval updates.
pub const DEFAULT_SCHEDULER_SUBJECT: &str = "idCache";

/// Per-worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bounded desk size.
    pub desk_capacity: usize,
    /// Events fetched per poll.
    pub page_size: usize,
    /// Deadline for each broker round-trip during an outbound send.
    pub broker_timeout: Duration,
    /// How long a replaced or removed worker may take to exit.
    pub stop_timeout: Duration,
    /// Poll interval assumed when none has been persisted for an identity.
    pub default_poll_interval_secs: u64,
    /// Subject on which `update_interval` notifications are published.
    pub scheduler_subject: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            desk_capacity: DESK_CAPACITY,
            page_size: POLL_PAGE_SIZE,
            broker_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            default_poll_interval_secs: 60,
            scheduler_subject: DEFAULT_SCHEDULER_SUBJECT.to_string(),
        }
    }
}

/// Bus command router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long to wait for room on a worker's desk or egress channel.
    pub enqueue_timeout: Duration,
    /// How long to wait for a worker's delivery ack.
    pub ack_timeout: Duration,
    pub management_subject: String,
    pub delivery_subject: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enqueue_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(30),
            management_subject: DEFAULT_MANAGEMENT_SUBJECT.to_string(),
            delivery_subject: DEFAULT_DELIVERY_SUBJECT.to_string(),
        }
    }
}

/// Process-level configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub db_path: PathBuf,
    pub worker: WorkerConfig,
    pub router: RouterConfig,
}

impl RelayConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/identity-relay.db"));

        let mut worker = WorkerConfig::default();
        let mut router = RouterConfig::default();

        if let Some(secs) = env_secs("RELAY_BROKER_TIMEOUT_SECS")? {
            worker.broker_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("RELAY_STOP_TIMEOUT_SECS")? {
            worker.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("RELAY_DEFAULT_POLL_INTERVAL_SECS")? {
            worker.default_poll_interval_secs = secs;
        }
        if let Some(secs) = env_secs("RELAY_ENQUEUE_TIMEOUT_SECS")? {
            router.enqueue_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("RELAY_ACK_TIMEOUT_SECS")? {
            router.ack_timeout = Duration::from_secs(secs);
        }
        if let Ok(subject) = std::env::var("RELAY_SCHEDULER_SUBJECT") {
            worker.scheduler_subject = subject;
        }
        if let Ok(subject) = std::env::var("RELAY_MANAGEMENT_SUBJECT") {
            router.management_subject = subject;
        }
        if let Ok(subject) = std::env::var("RELAY_DELIVERY_SUBJECT") {
            router.delivery_subject = subject;
        }

        Ok(Self {
            db_path,
            worker,
            router,
        })
    }
}

/// Read an optional positive number of seconds from the environment.
fn env_secs(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a positive number of seconds, got {raw:?}"),
            }),
            Ok(secs) => Ok(Some(secs)),
        },
        Err(_) => Ok(None),
    }
}
