//! Remote identities, their credentials and per-identity sync state.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use uuid::Uuid;

// Keys of the persisted sync-state map.
pub const LAST_SEEN_KEY: &str = "lastseendm";
pub const LAST_SYNC_KEY: &str = "lastsync";
pub const POLL_INTERVAL_KEY: &str = "pollinterval";
pub const LAST_ERROR_KEY: &str = "lastFetchError";
pub const FIRST_ERROR_DATE_KEY: &str = "firstErrorDate";
pub const LAST_ERROR_DATE_KEY: &str = "lastErrorDate";
pub const ERRORS_COUNT_KEY: &str = "errorsCount";

/// Identifies one (user, remote identity) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub user_id: Uuid,
    pub remote_id: Uuid,
}

impl IdentityKey {
    pub fn new(user_id: Uuid, remote_id: Uuid) -> Self {
        Self { user_id, remote_id }
    }
}

/// Registry key: user id immediately followed by remote id.
impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.user_id, self.remote_id)
    }
}

/// Opaque credential pair for a remote account.
#[derive(Clone)]
pub struct Credentials {
    pub token: SecretString,
    pub secret: SecretString,
}

impl Credentials {
    pub fn new(token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            secret: SecretString::from(secret.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials([REDACTED])")
    }
}

/// A user's account on an external network.
#[derive(Debug, Clone)]
pub struct RemoteIdentity {
    pub user_id: Uuid,
    pub remote_id: Uuid,
    /// Protocol name, e.g. `"twitter"` or `"loopback"`.
    pub protocol: String,
    /// Display handle on the remote network.
    pub identifier: String,
    pub credentials: Option<Credentials>,
    /// Raw sync-state map as persisted.
    pub infos: HashMap<String, String>,
}

impl RemoteIdentity {
    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(self.user_id, self.remote_id)
    }
}

/// Typed view over the persisted sync-state map.
///
/// Keys this type does not understand are kept in `extra` and written back
/// unchanged, so protocol-specific bookkeeping survives a round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub last_seen: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    /// Poll interval in seconds.
    pub poll_interval: Option<u64>,
    pub last_error: Option<String>,
    pub first_error_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub extra: BTreeMap<String, String>,
}

impl SyncState {
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut state = SyncState::default();
        for (key, value) in map {
            match key.as_str() {
                LAST_SEEN_KEY => state.last_seen = non_empty(value),
                LAST_SYNC_KEY => state.last_sync = parse_time(value),
                POLL_INTERVAL_KEY => state.poll_interval = value.trim().parse().ok(),
                LAST_ERROR_KEY => state.last_error = non_empty(value),
                FIRST_ERROR_DATE_KEY => state.first_error_at = parse_time(value),
                LAST_ERROR_DATE_KEY => state.last_error_at = parse_time(value),
                ERRORS_COUNT_KEY => state.error_count = value.trim().parse().unwrap_or(0),
                _ => {
                    state.extra.insert(key.clone(), value.clone());
                }
            }
        }
        state
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = self
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(ref seen) = self.last_seen {
            map.insert(LAST_SEEN_KEY.into(), seen.clone());
        }
        if let Some(ts) = self.last_sync {
            map.insert(LAST_SYNC_KEY.into(), ts.to_rfc3339());
        }
        if let Some(interval) = self.poll_interval {
            map.insert(POLL_INTERVAL_KEY.into(), interval.to_string());
        }
        if let Some(ref err) = self.last_error {
            map.insert(LAST_ERROR_KEY.into(), err.clone());
        }
        if let Some(ts) = self.first_error_at {
            map.insert(FIRST_ERROR_DATE_KEY.into(), ts.to_rfc3339());
        }
        if let Some(ts) = self.last_error_at {
            map.insert(LAST_ERROR_DATE_KEY.into(), ts.to_rfc3339());
        }
        if self.error_count > 0 {
            map.insert(ERRORS_COUNT_KEY.into(), self.error_count.to_string());
        }
        map
    }

    /// Record a failed fetch.
    pub fn record_error(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.last_error = Some(message.into());
        if self.first_error_at.is_none() {
            self.first_error_at = Some(at);
        }
        self.last_error_at = Some(at);
        self.error_count = self.error_count.saturating_add(1);
    }

    /// Forget error bookkeeping after a successful fetch.
    pub fn clear_errors(&mut self) {
        self.last_error = None;
        self.first_error_at = None;
        self.last_error_at = None;
        self.error_count = 0;
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0 || self.last_error.is_some()
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_concatenates_ids() {
        let user = Uuid::new_v4();
        let remote = Uuid::new_v4();
        let key = IdentityKey::new(user, remote);
        assert_eq!(key.to_string(), format!("{user}{remote}"));
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new("tok", "sek");
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("tok"));
        assert!(!dbg.contains("sek"));
    }

    #[test]
    fn sync_state_keeps_unknown_keys() {
        let mut map = HashMap::new();
        map.insert(LAST_SEEN_KEY.to_string(), "100".to_string());
        map.insert(POLL_INTERVAL_KEY.to_string(), "60".to_string());
        map.insert("timeline_cursor".to_string(), "abc".to_string());

        let state = SyncState::from_map(&map);
        assert_eq!(state.last_seen.as_deref(), Some("100"));
        assert_eq!(state.poll_interval, Some(60));
        assert_eq!(state.extra.get("timeline_cursor").map(String::as_str), Some("abc"));

        let back = state.to_map();
        assert_eq!(back, map);
    }

    #[test]
    fn record_error_keeps_first_date() {
        let mut state = SyncState::default();
        let first = Utc::now();
        state.record_error("boom", first);
        let later = first + chrono::Duration::seconds(30);
        state.record_error("boom again", later);

        assert_eq!(state.first_error_at, Some(first));
        assert_eq!(state.last_error_at, Some(later));
        assert_eq!(state.error_count, 2);
        assert_eq!(state.last_error.as_deref(), Some("boom again"));

        state.clear_errors();
        assert!(!state.has_errors());
        assert!(state.first_error_at.is_none());
    }

    #[test]
    fn unparseable_interval_is_dropped() {
        let mut map = HashMap::new();
        map.insert(POLL_INTERVAL_KEY.to_string(), "soon".to_string());
        assert_eq!(SyncState::from_map(&map).poll_interval, None);
    }
}
