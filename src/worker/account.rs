//! Account worker — one actor per remote identity.
//!
//! The worker owns an authenticated protocol session and runs two tasks:
//! the desk loop (poll cycles, stop) and the egress loop (outbound sends).
//! They share nothing but channels.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::command::DeskCommand;
use super::cursor::{EventCursor, compare_event_ids};
use super::egress::Egress;
use super::handle::WorkerHandle;
use crate::bus::{BrokerOrder, MessageBus};
use crate::config::{EGRESS_CAPACITY, WorkerConfig};
use crate::error::WorkerError;
use crate::identity::{IdentityKey, SyncState};
use crate::protocol::{ErrorClass, Protocol, ProtocolSession};
use crate::store::Database;

/// Shared dependencies for account workers.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn Database>,
    pub bus: Arc<dyn MessageBus>,
    pub protocol: Arc<dyn Protocol>,
    pub config: WorkerConfig,
}

/// Result of one inbound poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Events fetched and handed off; `skipped` were rejected by the broker.
    Completed { processed: usize, skipped: usize },
    /// Provider asked us to slow down; the new interval has been published.
    RateLimited { poll_interval: u64 },
    /// Fetch failed; error bookkeeping persisted.
    Failed,
    /// Session is unusable; the worker must stop.
    Fatal,
}

pub struct AccountWorker {
    key: IdentityKey,
    protocol: String,
    session: ProtocolSession,
    cursor: EventCursor,
    /// Peer id → display name. Private to this worker, lives until restart.
    names: HashMap<u64, String>,
    deps: WorkerDeps,
}

impl AccountWorker {
    /// Load the identity and connect an authenticated session for it.
    pub async fn new(key: IdentityKey, deps: WorkerDeps) -> Result<Self, WorkerError> {
        let identity = deps
            .store
            .retrieve_identity(key.user_id, key.remote_id)
            .await?
            .ok_or_else(|| WorkerError::IdentityNotFound {
                user_id: key.user_id.to_string(),
                remote_id: key.remote_id.to_string(),
            })?;

        if identity.credentials.is_none() {
            return Err(WorkerError::CredentialsMissing {
                user_id: key.user_id.to_string(),
                remote_id: key.remote_id.to_string(),
            });
        }

        let protocol = deps.protocol.name().to_string();
        if !identity.protocol.is_empty() && identity.protocol != protocol {
            return Err(WorkerError::ProtocolUnavailable {
                protocol: identity.protocol,
            });
        }

        let session = deps
            .protocol
            .connect(&identity)
            .await
            .map_err(|e| WorkerError::Connect {
                protocol: protocol.clone(),
                reason: e.to_string(),
            })?;

        let cursor = EventCursor::new(SyncState::from_map(&identity.infos).last_seen.as_deref());

        Ok(Self {
            key,
            protocol,
            session,
            cursor,
            names: HashMap::new(),
            deps,
        })
    }

    pub fn key(&self) -> IdentityKey {
        self.key
    }

    pub fn cursor(&self) -> &EventCursor {
        &self.cursor
    }

    /// Spawn the desk and egress loops.
    pub fn start(self, halt: broadcast::Receiver<()>) -> WorkerHandle {
        let (desk_tx, desk_rx) = mpsc::channel(self.deps.config.desk_capacity.max(1));
        let (egress_tx, egress_rx) = mpsc::channel(EGRESS_CAPACITY);

        let egress = Egress::new(
            self.key,
            self.session.clone(),
            self.deps.config.broker_timeout,
            desk_tx.clone(),
        );
        let handle = WorkerHandle::new(self.key, desk_tx, egress_tx);

        tokio::spawn(egress.run(egress_rx, halt));
        tokio::spawn(self.run_desk(desk_rx));
        handle
    }

    async fn run_desk(mut self, mut desk: mpsc::Receiver<DeskCommand>) {
        info!(
            user_id = %self.key.user_id,
            remote_id = %self.key.remote_id,
            protocol = %self.protocol,
            cursor = %self.cursor.as_str(),
            "Account worker started"
        );

        while let Some(command) = desk.recv().await {
            match command {
                DeskCommand::Poll => match self.poll().await {
                    Ok(PollOutcome::Fatal) => {
                        error!(
                            remote_id = %self.key.remote_id,
                            "Remote session is no longer valid, stopping worker"
                        );
                        break;
                    }
                    Ok(outcome) => {
                        debug!(remote_id = %self.key.remote_id, ?outcome, "Poll cycle finished")
                    }
                    Err(e) => {
                        warn!(remote_id = %self.key.remote_id, error = %e, "Poll cycle failed")
                    }
                },
                DeskCommand::Stop => break,
            }
        }

        self.session.broker.shutdown().await;
        desk.close();
        info!(
            user_id = %self.key.user_id,
            remote_id = %self.key.remote_id,
            "Account worker stopped"
        );
    }

    /// Run one inbound fetch cycle to completion.
    pub async fn poll(&mut self) -> Result<PollOutcome, WorkerError> {
        let store = Arc::clone(&self.deps.store);
        let raw = store
            .retrieve_sync_state(self.key.user_id, self.key.remote_id)
            .await?;
        let mut state = SyncState::from_map(&raw);

        let api = Arc::clone(&self.session.api);
        let mut events = match api.fetch_events(self.deps.config.page_size).await {
            Ok(events) => events,
            Err(err) => {
                let class = api.classify(&err);
                return match class {
                    ErrorClass::RateLimited => self.back_off(state).await,
                    ErrorClass::Transient | ErrorClass::Fatal => {
                        warn!(
                            remote_id = %self.key.remote_id,
                            error = %err,
                            ?class,
                            "Failed to fetch direct messages"
                        );
                        state.record_error(err.to_string(), Utc::now());
                        self.save(&state).await?;
                        Ok(if class == ErrorClass::Fatal {
                            PollOutcome::Fatal
                        } else {
                            PollOutcome::Failed
                        })
                    }
                };
            }
        };

        events.sort_by(|a, b| compare_event_ids(&a.id, &b.id));

        let mut processed = 0;
        let mut skipped = 0;
        for mut event in events {
            if !self.cursor.is_before(&event.id) {
                continue;
            }
            if event.sender_name.is_none() {
                event.sender_name = self.display_name(&event.sender_id).await;
            }
            if event.recipient_name.is_none() {
                event.recipient_name = self.display_name(&event.recipient_id).await;
            }

            match self.session.broker.canonicalize_inbound(&event).await {
                Ok(()) => {
                    self.cursor.advance(&event.id);
                    processed += 1;
                }
                Err(e) => {
                    warn!(
                        remote_id = %self.key.remote_id,
                        event_id = %event.id,
                        error = %e,
                        "Skipping event the broker could not handle"
                    );
                    skipped += 1;
                }
            }
        }

        state.last_seen = Some(self.cursor.as_str().to_string());
        state.last_sync = Some(Utc::now());
        state.clear_errors();
        self.save(&state).await?;

        Ok(PollOutcome::Completed { processed, skipped })
    }

    /// Double the poll interval and tell the scheduler about it.
    async fn back_off(&self, mut state: SyncState) -> Result<PollOutcome, WorkerError> {
        let current = state
            .poll_interval
            .filter(|secs| *secs > 0)
            .unwrap_or(self.deps.config.default_poll_interval_secs);
        let next = current.saturating_mul(2);
        state.poll_interval = Some(next);
        self.save(&state).await?;

        warn!(
            remote_id = %self.key.remote_id,
            from = current,
            to = next,
            "Rate limited, backing off"
        );

        let notice = BrokerOrder::update_interval(self.key, self.protocol.as_str(), next);
        match notice.encode() {
            Ok(payload) => {
                if let Err(e) = self
                    .deps
                    .bus
                    .publish(&self.deps.config.scheduler_subject, payload)
                    .await
                {
                    warn!(error = %e, "Failed to publish update_interval");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode update_interval"),
        }

        Ok(PollOutcome::RateLimited {
            poll_interval: next,
        })
    }

    /// Display name of a peer, from cache or the remote API.
    async fn display_name(&mut self, peer_id: &str) -> Option<String> {
        let id: u64 = peer_id.parse().ok()?;
        if let Some(name) = self.names.get(&id) {
            return Some(name.clone());
        }
        match self.session.api.lookup_display_name(id).await {
            Ok(Some(name)) => {
                self.names.insert(id, name.clone());
                Some(name)
            }
            Ok(None) => None,
            Err(e) => {
                debug!(peer_id = id, error = %e, "Display name lookup failed");
                None
            }
        }
    }

    async fn save(&self, state: &SyncState) -> Result<(), WorkerError> {
        self.deps
            .store
            .update_sync_state(self.key.user_id, self.key.remote_id, &state.to_map())
            .await?;
        Ok(())
    }
}
