//! Last-seen event cursor.
//!
//! Provider ids are opaque strings, but most networks hand out numeric ids
//! whose string form does not sort correctly (`"99" > "100"`). Ids made only of
//! ASCII digits are therefore compared numerically (leading zeros ignored,
//! arbitrary length) and rank before every other id. Other ids compare in
//! plain string order among themselves.

use std::cmp::Ordering;

/// Cursor value meaning "nothing seen yet".
pub const CURSOR_START: &str = "0";

/// Total order over provider event ids.
pub fn compare_event_ids(a: &str, b: &str) -> Ordering {
    match (numeric(a), numeric(b)) {
        (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Digits of `id` without leading zeros, if `id` is a non-empty digit string.
fn numeric(id: &str) -> Option<&str> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(id.trim_start_matches('0'))
}

/// Monotonic marker of the last successfully handed-off event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCursor(String);

impl EventCursor {
    pub fn new(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => Self(v.to_string()),
            _ => Self(CURSOR_START.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `id` comes strictly after the cursor.
    pub fn is_before(&self, id: &str) -> bool {
        compare_event_ids(&self.0, id) == Ordering::Less
    }

    /// Move forward to `id`. Never moves backward; returns whether it moved.
    pub fn advance(&mut self, id: &str) -> bool {
        if self.is_before(id) {
            self.0 = id.to_string();
            true
        } else {
            false
        }
    }
}

impl Default for EventCursor {
    fn default() -> Self {
        Self::new(None)
    }
}
