//! Account workers and their registry.
//!
//! - `account` — the per-identity actor: desk loop and inbound poll cycle
//! - `egress` — outbound send protocol and the egress loop
//! - `handle` — cloneable control handle with bounded enqueue
//! - `command` — desk commands and egress requests
//! - `cursor` — last-seen event cursor and id ordering
//! - `registry` — one live worker per identity

pub mod account;
pub mod command;
pub mod cursor;
pub mod egress;
pub mod handle;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use account::{AccountWorker, PollOutcome, WorkerDeps};
pub use command::{DeskCommand, EgressRequest};
pub use cursor::{CURSOR_START, EventCursor, compare_event_ids};
pub use egress::send_outbound;
pub use handle::WorkerHandle;
pub use registry::WorkerRegistry;
