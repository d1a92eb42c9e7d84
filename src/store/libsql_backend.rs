//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::{Credentials, RemoteIdentity};
use crate::store::migrations;
use crate::store::traits::{Database, MessageDirection, StoredMessage};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Credentials as stored in the `credentials` column.
#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    token: String,
    secret: String,
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a RemoteIdentity.
///
/// Column order matches IDENTITY_COLUMNS:
/// 0:user_id, 1:remote_id, 2:protocol, 3:identifier, 4:credentials, 5:infos
fn row_to_identity(row: &libsql::Row) -> Result<RemoteIdentity, DatabaseError> {
    let get = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))
    };

    let credentials = match row.get::<String>(4).ok() {
        Some(raw) => {
            let stored: StoredCredentials = serde_json::from_str(&raw)
                .map_err(|e| DatabaseError::Serialization(format!("credentials: {e}")))?;
            Some(Credentials::new(stored.token, stored.secret))
        }
        None => None,
    };

    let infos: HashMap<String, String> = serde_json::from_str(&get(5)?)
        .map_err(|e| DatabaseError::Serialization(format!("infos: {e}")))?;

    Ok(RemoteIdentity {
        user_id: parse_uuid(&get(0)?)?,
        remote_id: parse_uuid(&get(1)?)?,
        protocol: get(2)?,
        identifier: get(3)?,
        credentials,
        infos,
    })
}

/// Map a libsql Row to a StoredMessage (column order matches MESSAGE_COLUMNS).
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let get = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))
    };

    Ok(StoredMessage {
        id: parse_uuid(&get(0)?)?,
        user_id: parse_uuid(&get(1)?)?,
        remote_id: parse_uuid(&get(2)?)?,
        external_id: get(3)?,
        protocol: get(4)?,
        direction: MessageDirection::parse(&get(5)?),
        sender: get(6)?,
        recipient: get(7)?,
        content: get(8)?,
        received_at: parse_datetime(&get(9)?),
        metadata: row.get::<String>(10).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const IDENTITY_COLUMNS: &str = "user_id, remote_id, protocol, identifier, credentials, infos";

const MESSAGE_COLUMNS: &str = "id, user_id, remote_id, external_id, protocol, direction, sender, recipient, content, received_at, metadata";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Identities ──────────────────────────────────────────────────

    async fn retrieve_identity(
        &self,
        user_id: Uuid,
        remote_id: Uuid,
    ) -> Result<Option<RemoteIdentity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {IDENTITY_COLUMNS} FROM remote_identities
                     WHERE user_id = ?1 AND remote_id = ?2"
                ),
                params![user_id.to_string(), remote_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retrieve_identity: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_identity(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("retrieve_identity: {e}"))),
        }
    }

    async fn upsert_identity(&self, identity: &RemoteIdentity) -> Result<(), DatabaseError> {
        let credentials = identity
            .credentials
            .as_ref()
            .map(|c| {
                serde_json::to_string(&StoredCredentials {
                    token: c.token.expose_secret().to_string(),
                    secret: c.secret.expose_secret().to_string(),
                })
            })
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("credentials: {e}")))?;
        let infos = serde_json::to_string(&identity.infos)
            .map_err(|e| DatabaseError::Serialization(format!("infos: {e}")))?;
        let now = Utc::now().to_rfc3339();

        self.conn()
            .execute(
                "INSERT INTO remote_identities
                    (user_id, remote_id, protocol, identifier, credentials, infos, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(user_id, remote_id) DO UPDATE SET
                    protocol = excluded.protocol,
                    identifier = excluded.identifier,
                    credentials = excluded.credentials,
                    infos = excluded.infos,
                    updated_at = excluded.updated_at",
                params![
                    identity.user_id.to_string(),
                    identity.remote_id.to_string(),
                    identity.protocol.as_str(),
                    identity.identifier.as_str(),
                    opt_text(credentials.as_deref()),
                    infos,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_identity: {e}")))?;

        debug!(remote_id = %identity.remote_id, "Remote identity stored");
        Ok(())
    }

    // ── Sync state ──────────────────────────────────────────────────

    async fn retrieve_sync_state(
        &self,
        user_id: Uuid,
        remote_id: Uuid,
    ) -> Result<HashMap<String, String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT infos FROM remote_identities WHERE user_id = ?1 AND remote_id = ?2",
                params![user_id.to_string(), remote_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retrieve_sync_state: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("retrieve_sync_state: {e}")))?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "remote_identity".into(),
                id: remote_id.to_string(),
            })?;

        let raw: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| DatabaseError::Serialization(format!("infos: {e}")))
    }

    async fn update_sync_state(
        &self,
        user_id: Uuid,
        remote_id: Uuid,
        state: &HashMap<String, String>,
    ) -> Result<(), DatabaseError> {
        let infos = serde_json::to_string(state)
            .map_err(|e| DatabaseError::Serialization(format!("infos: {e}")))?;

        let affected = self
            .conn()
            .execute(
                "UPDATE remote_identities SET infos = ?3, updated_at = ?4
                 WHERE user_id = ?1 AND remote_id = ?2",
                params![
                    user_id.to_string(),
                    remote_id.to_string(),
                    infos,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_sync_state: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "remote_identity".into(),
                id: remote_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &StoredMessage) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO messages (id, user_id, remote_id, external_id, protocol,
                    direction, sender, recipient, content, received_at, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    message.id.to_string(),
                    message.user_id.to_string(),
                    message.remote_id.to_string(),
                    message.external_id.as_str(),
                    message.protocol.as_str(),
                    message.direction.as_str(),
                    message.sender.as_str(),
                    message.recipient.as_str(),
                    message.content.as_str(),
                    message.received_at.to_rfc3339(),
                    opt_text(message.metadata.as_deref()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        debug!(
            external_id = %message.external_id,
            inserted = affected > 0,
            "Message stored"
        );
        Ok(affected > 0)
    }

    async fn get_message_by_external_id(
        &self,
        user_id: Uuid,
        remote_id: Uuid,
        external_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE user_id = ?1 AND remote_id = ?2 AND external_id = ?3"
                ),
                params![user_id.to_string(), remote_id.to_string(), external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message_by_external_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_message_by_external_id: {e}"
            ))),
        }
    }

    async fn list_messages(
        &self,
        user_id: Uuid,
        remote_id: Uuid,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE user_id = ?1 AND remote_id = ?2
                     ORDER BY received_at ASC, created_at ASC, rowid ASC
                     LIMIT ?3"
                ),
                params![user_id.to_string(), remote_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?
        {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LAST_SEEN_KEY, POLL_INTERVAL_KEY};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_identity() -> RemoteIdentity {
        let mut infos = HashMap::new();
        infos.insert(LAST_SEEN_KEY.to_string(), "100".to_string());
        RemoteIdentity {
            user_id: Uuid::new_v4(),
            remote_id: Uuid::new_v4(),
            protocol: "loopback".into(),
            identifier: "@alice".into(),
            credentials: Some(Credentials::new("tok", "sek")),
            infos,
        }
    }

    fn make_message(identity: &RemoteIdentity, external_id: &str) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            user_id: identity.user_id,
            remote_id: identity.remote_id,
            external_id: external_id.into(),
            protocol: "loopback".into(),
            direction: MessageDirection::Inbound,
            sender: "bob".into(),
            recipient: "alice".into(),
            content: "hello".into(),
            received_at: Utc::now(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn identity_round_trip() {
        let db = test_db().await;
        let identity = make_identity();
        db.upsert_identity(&identity).await.unwrap();

        let fetched = db
            .retrieve_identity(identity.user_id, identity.remote_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.identifier, "@alice");
        assert_eq!(fetched.protocol, "loopback");
        let creds = fetched.credentials.unwrap();
        assert_eq!(creds.token.expose_secret(), "tok");
        assert_eq!(fetched.infos.get(LAST_SEEN_KEY).map(String::as_str), Some("100"));
    }

    #[tokio::test]
    async fn identity_without_credentials() {
        let db = test_db().await;
        let mut identity = make_identity();
        identity.credentials = None;
        db.upsert_identity(&identity).await.unwrap();

        let fetched = db
            .retrieve_identity(identity.user_id, identity.remote_id)
            .await
            .unwrap()
            .unwrap();
        assert!(fetched.credentials.is_none());
    }

    #[tokio::test]
    async fn missing_identity_is_none() {
        let db = test_db().await;
        let result = db
            .retrieve_identity(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn sync_state_update_and_read() {
        let db = test_db().await;
        let identity = make_identity();
        db.upsert_identity(&identity).await.unwrap();

        let mut state = db
            .retrieve_sync_state(identity.user_id, identity.remote_id)
            .await
            .unwrap();
        state.insert(POLL_INTERVAL_KEY.to_string(), "120".to_string());
        db.update_sync_state(identity.user_id, identity.remote_id, &state)
            .await
            .unwrap();

        let reread = db
            .retrieve_sync_state(identity.user_id, identity.remote_id)
            .await
            .unwrap();
        assert_eq!(reread.get(POLL_INTERVAL_KEY).map(String::as_str), Some("120"));
        assert_eq!(reread.get(LAST_SEEN_KEY).map(String::as_str), Some("100"));
    }

    #[tokio::test]
    async fn sync_state_of_unknown_identity_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_sync_state(Uuid::new_v4(), Uuid::new_v4(), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn insert_message_dedups_by_external_id() {
        let db = test_db().await;
        let identity = make_identity();

        assert!(db.insert_message(&make_message(&identity, "42")).await.unwrap());
        assert!(!db.insert_message(&make_message(&identity, "42")).await.unwrap());

        let found = db
            .get_message_by_external_id(identity.user_id, identity.remote_id, "42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.content, "hello");
        assert_eq!(found.direction, MessageDirection::Inbound);

        let all = db
            .list_messages(identity.user_id, identity.remote_id, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn local_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");
        let identity = make_identity();
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_identity(&identity).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(
            db.retrieve_identity(identity.user_id, identity.remote_id)
                .await
                .unwrap()
                .is_some()
        );
    }
}
