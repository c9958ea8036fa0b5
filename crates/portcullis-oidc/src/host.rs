//! Seams to the embedding host: outbound HTTP, a shared key-value store,
//! and the wall clock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::error::TransportError;

/// Response handed back by the host transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// A 200 JSON response, the shape every IdP document arrives in.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200)
            .with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Media type without parameters, lowercased.
    pub fn media_type(&self) -> String {
        self.header("content-type")
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Require a 200 response carrying JSON.
    pub fn ensure_json(&self, url: &str) -> Result<(), TransportError> {
        if self.status != 200 {
            return Err(TransportError::UnexpectedStatus {
                url: url.to_string(),
                status: self.status,
                detail: String::new(),
            });
        }
        let media_type = self.media_type();
        if media_type != "application/json" && !media_type.ends_with("+json") {
            return Err(TransportError::UnexpectedContentType {
                url: url.to_string(),
                content_type: media_type,
            });
        }
        Ok(())
    }
}

/// Non-blocking HTTP primitive provided by the host.
///
/// Deadlines are the transport's business; the core only sees the outcome.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, TransportError>;

    async fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError>;
}

/// Returned when a compare-and-swap finds a newer version than expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("compare-and-swap version mismatch")]
pub struct CasMismatch;

/// Process-wide key-value store with versioned writes.
///
/// Version `0` means "absent", so `compare_and_swap(key, v, 0)` is an
/// insert-if-absent.
pub trait SharedStore: Send + Sync {
    /// Current value and version.
    fn get(&self, key: &str) -> Option<(Vec<u8>, u64)>;

    /// Store `value` if the current version equals `expected`. Returns the
    /// new version.
    fn compare_and_swap(&self, key: &str, value: Vec<u8>, expected: u64)
        -> Result<u64, CasMismatch>;
}

/// `SharedStore` backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, (Vec<u8>, u64)>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedStore for InMemoryStore {
    fn get(&self, key: &str) -> Option<(Vec<u8>, u64)> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: u64,
    ) -> Result<u64, CasMismatch> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().1 != expected {
                    return Err(CasMismatch);
                }
                let version = expected + 1;
                occupied.insert((value, version));
                Ok(version)
            }
            Entry::Vacant(vacant) => {
                if expected != 0 {
                    return Err(CasMismatch);
                }
                vacant.insert((value, 1));
                Ok(1)
            }
        }
    }
}

/// Whole-second UNIX time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Settable clock for tests and replay tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_json_accepts_charset_parameter() {
        let resp = HttpResponse::new(200)
            .with_header("Content-Type", "application/json; charset=utf-8")
            .with_body("{}");
        assert!(resp.ensure_json("https://idp.example").is_ok());
        assert_eq!(resp.media_type(), "application/json");
    }

    #[test]
    fn ensure_json_rejects_status_and_type() {
        let resp = HttpResponse::new(503).with_header("content-type", "application/json");
        assert!(matches!(
            resp.ensure_json("u"),
            Err(TransportError::UnexpectedStatus { status: 503, .. })
        ));

        let resp = HttpResponse::new(200).with_header("content-type", "text/html");
        assert!(matches!(
            resp.ensure_json("u"),
            Err(TransportError::UnexpectedContentType { .. })
        ));

        let resp = HttpResponse::new(200);
        assert!(resp.ensure_json("u").is_err());
    }

    #[test]
    fn cas_insert_if_absent() {
        let store = InMemoryStore::new();
        assert_eq!(store.compare_and_swap("k", b"a".to_vec(), 0), Ok(1));
        assert_eq!(store.compare_and_swap("k", b"b".to_vec(), 0), Err(CasMismatch));
        assert_eq!(store.get("k"), Some((b"a".to_vec(), 1)));
    }

    #[test]
    fn cas_update_requires_current_version() {
        let store = InMemoryStore::new();
        store.compare_and_swap("k", b"a".to_vec(), 0).unwrap();
        assert_eq!(store.compare_and_swap("k", b"b".to_vec(), 1), Ok(2));
        assert_eq!(store.compare_and_swap("k", b"c".to_vec(), 1), Err(CasMismatch));
        assert_eq!(store.compare_and_swap("missing", b"x".to_vec(), 3), Err(CasMismatch));
        assert_eq!(store.get("k"), Some((b"b".to_vec(), 2)));
    }

    #[test]
    fn manual_clock_moves() {
        let clock = ManualClock::new(100);
        clock.advance(5);
        assert_eq!(clock.now(), 105);
        clock.set(7);
        assert_eq!(clock.now(), 7);
    }
}
