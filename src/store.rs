//! The keyspace and stream engine (component C2 of the design spec).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{RedisError, Result};

/// A stream entry id: a non-negative `(t_ms, seq)` pair, compared as a
/// numeric pair rather than lexicographically on the formatted string (see
/// §9 of the design spec — `"10-0" < "2-0"` lexicographically but not
/// numerically).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId(pub u64, pub u64);

impl StreamId {
    pub const MIN: StreamId = StreamId(0, 0);
    pub const MAX: StreamId = StreamId(u64::MAX, u64::MAX);

    pub fn new(t_ms: u64, seq: u64) -> Self {
        StreamId(t_ms, seq)
    }

    /// Parse a user-supplied range bound, normalizing a bare `"5"` to
    /// `"5-0"` as required for `XRANGE`'s lower bound.
    fn parse_bound(s: &str) -> Result<StreamId> {
        match s.split_once('-') {
            Some((t, seq)) => {
                let t: u64 = t
                    .parse()
                    .map_err(|_| RedisError::Command(format!("invalid stream id: {}", s)))?;
                let seq: u64 = seq
                    .parse()
                    .map_err(|_| RedisError::Command(format!("invalid stream id: {}", s)))?;
                Ok(StreamId(t, seq))
            }
            None => {
                let t: u64 = s
                    .parse()
                    .map_err(|_| RedisError::Command(format!("invalid stream id: {}", s)))?;
                Ok(StreamId(t, 0))
            }
        }
    }
}

impl PartialOrd for StreamId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0, self.1).cmp(&(other.0, other.1))
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.0, self.1)
    }
}

/// The three shapes a requested XADD id can take: fully explicit, an
/// explicit millisecond part with an auto sequence, or fully automatic.
enum IdRequest {
    Explicit(StreamId),
    AutoSeq(u64),
    Auto,
}

fn parse_id_request(s: &str) -> Result<IdRequest> {
    if s == "*" {
        return Ok(IdRequest::Auto);
    }
    match s.split_once('-') {
        Some((t, "*")) => {
            let t: u64 = t
                .parse()
                .map_err(|_| RedisError::Command(format!("invalid stream id: {}", s)))?;
            Ok(IdRequest::AutoSeq(t))
        }
        Some((t, seq)) => {
            let t: u64 = t
                .parse()
                .map_err(|_| RedisError::Command(format!("invalid stream id: {}", s)))?;
            let seq: u64 = seq
                .parse()
                .map_err(|_| RedisError::Command(format!("invalid stream id: {}", s)))?;
            Ok(IdRequest::Explicit(StreamId(t, seq)))
        }
        None => Err(RedisError::Command(format!("invalid stream id: {}", s))),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: StreamId,
    pub field: String,
    pub value: String,
}

enum Value {
    String(String),
    Stream(Vec<StreamEntry>),
}

struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at_ms, Some(deadline) if now_ms() >= deadline)
    }
}

/// The process-wide map key -> entry, plus the lazily-created per-key
/// notifiers used by blocking `XREAD`. Guarded by a single `RwLock` at the
/// `Server` level (see §5 of the design spec): reads take a shared lock,
/// mutations take an exclusive lock covering the whole read-modify-write
/// step, so `XADD`'s last-id check and `GET`'s expiry check are each atomic.
pub struct KvStore {
    entries: HashMap<String, Entry>,
    stream_waiters: HashMap<String, Arc<Notify>>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore {
            entries: HashMap::new(),
            stream_waiters: HashMap::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<String> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                trace!(key, "evicting expired entry on read");
                self.entries.remove(key);
                return None;
            }
            if let Value::String(s) = &entry.value {
                return Some(s.clone());
            }
        }
        None
    }

    pub fn set(&mut self, key: &str, value: &str, ttl_ms: Option<u64>) {
        let expires_at_ms = ttl_ms.map(|ttl| now_ms() + ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::String(value.to_string()),
                expires_at_ms,
            },
        );
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// `"string"`, `"stream"`, or `"none"`.
    pub fn type_of(&self, key: &str) -> &'static str {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => match &entry.value {
                Value::String(_) => "string",
                Value::Stream(_) => "stream",
            },
            _ => "none",
        }
    }

    fn stream_entries(&self, key: &str) -> Result<&[StreamEntry]> {
        match self.entries.get(key) {
            None => Ok(&[]),
            Some(entry) => match &entry.value {
                Value::Stream(entries) => Ok(entries),
                Value::String(_) => Err(RedisError::WrongType),
            },
        }
    }

    pub fn last_stream_id(&self, key: &str) -> Result<StreamId> {
        Ok(self
            .stream_entries(key)?
            .last()
            .map(|e| e.id)
            .unwrap_or(StreamId::MIN))
    }

    /// Appends one entry, assigning its id per §4.2's three request shapes,
    /// and notifies every registered blocking-read waiter for this key.
    pub fn stream_append(
        &mut self,
        key: &str,
        id_pattern: &str,
        field: &str,
        value: &str,
    ) -> Result<StreamId> {
        let last_id = self.stream_entries(key)?.last().map(|e| e.id);

        let id = match parse_id_request(id_pattern)? {
            IdRequest::Explicit(id) => id,
            IdRequest::AutoSeq(t) => {
                let default_seq = if t == 0 { 1 } else { 0 };
                match last_id {
                    Some(last) if last.0 == t => StreamId(t, last.1 + 1),
                    _ => StreamId(t, default_seq),
                }
            }
            IdRequest::Auto => {
                let t = now_ms();
                match last_id {
                    Some(last) if last.0 == t => StreamId(t, last.1 + 1),
                    _ => StreamId(t, 0),
                }
            }
        };

        if id <= StreamId::MIN {
            return Err(RedisError::XaddZero);
        }
        if let Some(last) = last_id {
            if id <= last {
                return Err(RedisError::XaddBackward);
            }
        }

        // the WrongType case was already ruled out by `stream_entries(key)?` above
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Stream(Vec::new()),
            expires_at_ms: None,
        });
        match &mut entry.value {
            Value::Stream(entries) => entries.push(StreamEntry {
                id,
                field: field.to_string(),
                value: value.to_string(),
            }),
            Value::String(_) => unreachable!(),
        }

        debug!(key, id = %id, "stream append");
        if let Some(notify) = self.stream_waiters.get(key) {
            notify.notify_waiters();
        }

        Ok(id)
    }

    /// Inclusive range query. `-`/`+` are resolved to the stream's first/last
    /// id by the caller before calling this (they need to know the entries).
    pub fn stream_range(&self, key: &str, start: StreamId, end: StreamId) -> Result<Vec<StreamEntry>> {
        Ok(self
            .stream_entries(key)?
            .iter()
            .filter(|e| e.id >= start && e.id <= end)
            .cloned()
            .collect())
    }

    /// Entries strictly greater than `after`.
    pub fn stream_read_after(&self, key: &str, after: StreamId) -> Result<Vec<StreamEntry>> {
        Ok(self
            .stream_entries(key)?
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect())
    }

    /// Lazily creates (and hands back a clone of) the notifier for `key`,
    /// used by `XREAD BLOCK`. Must be called while still holding the write
    /// lock that guards `self` so a concurrent `stream_append` cannot fire
    /// its notification between the caller checking for fresh data and
    /// registering itself as a waiter.
    pub fn stream_notifier(&mut self, key: &str) -> Arc<Notify> {
        self.stream_waiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Seeds a string entry loaded from an on-disk RDB snapshot at startup.
    pub fn load_string(&mut self, key: String, value: String, expires_at_ms: Option<u64>) {
        self.entries.insert(
            key,
            Entry {
                value: Value::String(value),
                expires_at_ms,
            },
        );
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses an `XRANGE`/`XREAD` range bound, given how `-`/`+`/`$` resolve for
/// an empty stream.
pub fn parse_range_start(s: &str, first_id: StreamId) -> Result<StreamId> {
    if s == "-" {
        Ok(first_id)
    } else {
        StreamId::parse_bound(s)
    }
}

pub fn parse_range_end(s: &str, last_id: StreamId) -> Result<StreamId> {
    if s == "+" {
        Ok(last_id)
    } else {
        StreamId::parse_bound(s)
    }
}

impl FromStr for StreamId {
    type Err = RedisError;

    fn from_str(s: &str) -> Result<Self> {
        StreamId::parse_bound(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn string_roundtrip_and_ttl_expiry() {
        let mut store = KvStore::new();
        store.set("k", "v", None);
        assert_eq!(store.get("k"), Some("v".to_string()));

        store.set("k2", "v2", Some(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.get("k2"), None);
        assert_eq!(store.type_of("k2"), "none");
    }

    #[test]
    fn stream_auto_id_generation() {
        let mut store = KvStore::new();
        assert!(matches!(
            store.stream_append("s", "0-0", "k", "v"),
            Err(RedisError::XaddZero)
        ));
        assert_eq!(store.stream_append("s", "1-1", "k", "v").unwrap(), StreamId(1, 1));
        assert_eq!(store.stream_append("s", "1-*", "k", "v").unwrap(), StreamId(1, 2));
        assert!(matches!(
            store.stream_append("s", "1-2", "k", "v"),
            Err(RedisError::XaddBackward)
        ));
    }

    #[test]
    fn stream_auto_seq_zero_t_defaults_to_one() {
        let mut store = KvStore::new();
        assert_eq!(store.stream_append("s", "0-*", "k", "v").unwrap(), StreamId(0, 1));
    }

    #[test]
    fn stream_range_is_inclusive_and_numeric() {
        let mut store = KvStore::new();
        store.stream_append("s", "1-0", "k", "v").unwrap();
        store.stream_append("s", "1-1", "k", "v").unwrap();
        store.stream_append("s", "2-0", "k", "v").unwrap();

        let all = store.stream_range("s", StreamId(1, 0), StreamId(2, 0)).unwrap();
        assert_eq!(all.len(), 3);

        let tail = store.stream_range("s", StreamId(1, 1), StreamId(2, 0)).unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn stream_append_on_string_key_is_wrong_type() {
        let mut store = KvStore::new();
        store.set("k", "v", None);
        assert!(matches!(
            store.stream_append("k", "1-1", "f", "v"),
            Err(RedisError::WrongType)
        ));
    }
}
