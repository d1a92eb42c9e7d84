//! Persistence layer — identities, sync state and broker-stored messages.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, MessageDirection, StoredMessage};
