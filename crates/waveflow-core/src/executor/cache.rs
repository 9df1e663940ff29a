//! Task-level response caching.
//!
//! The provider stores opaque records with an absolute expiry computed at
//! insertion; expired entries are treated as absent on read. Key
//! derivation is the caller's responsibility ([`cache_key`] is the hash
//! the orchestrator uses); the provider never hashes anything itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::executor::http::HttpTaskResponse;
use crate::model::HttpMethod;

/// Cache behavior for a task or step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    /// Methods eligible for caching.
    pub methods: Vec<HttpMethod>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 60,
            methods: vec![HttpMethod::GET],
        }
    }
}

impl CacheConfig {
    pub fn allows(&self, method: HttpMethod) -> bool {
        self.enabled && self.methods.contains(&method)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// A cached HTTP response with its absolute expiry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl CachedResponse {
    pub fn from_response(response: &HttpTaskResponse) -> Self {
        Self {
            status_code: response.status_code,
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at: Utc::now(),
            ttl_ms: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.stored_at + ChronoDuration::milliseconds(self.ttl_ms as i64) < now
    }
}

/// Storage capability for cached responses. Backed by an in-process map
/// in development or a shared distributed store in production; the
/// interface hides which.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// `None` for absent or expired entries.
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>>;

    /// Store a record; expiry is `now + ttl`, computed at insertion.
    async fn set(&self, key: &str, record: CachedResponse, ttl: Duration) -> Result<()>;

    async fn invalidate(&self, key: &str) -> Result<()>;

    /// Drop all keys matching a `*` glob; returns how many were removed.
    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64>;
}

/// Development cache: an in-process map with last-writer-wins semantics.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CachedResponse>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheProvider for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(record) if record.is_expired(Utc::now()) => {
                entries.remove(key);
                Ok(None)
            }
            Some(record) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, mut record: CachedResponse, ttl: Duration) -> Result<()> {
        record.stored_at = Utc::now();
        record.ttl_ms = ttl.as_millis() as u64;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64> {
        let regex = glob_to_regex(pattern)?;
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !regex.is_match(key));
        Ok((before - entries.len()) as u64)
    }
}

/// Stable cache key over the identity of an outbound call: task name,
/// method, resolved URL, resolved headers, and resolved body.
pub fn cache_key(
    task: &str,
    method: HttpMethod,
    url: &str,
    headers: &BTreeMap<String, String>,
    body: Option<&Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task.as_bytes());
    hasher.update([0]);
    hasher.update(method.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(url.as_bytes());
    hasher.update([0]);
    for (name, value) in headers {
        hasher.update(name.as_bytes());
        hasher.update([1]);
        hasher.update(value.as_bytes());
        hasher.update([1]);
    }
    hasher.update([0]);
    if let Some(body) = body {
        hasher.update(body.to_string().as_bytes());
    }

    let digest = hasher.finalize();
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest {
        key.push_str(&format!("{:02x}", byte));
    }
    key
}

fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let escaped = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    regex::Regex::new(&format!("^{}$", escaped)).map_err(|e| EngineError::Internal {
        message: format!("invalid cache pattern {:?}: {}", pattern, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(body: Value) -> CachedResponse {
        CachedResponse {
            status_code: 200,
            headers: BTreeMap::new(),
            body,
            stored_at: Utc::now(),
            ttl_ms: 0,
        }
    }

    #[tokio::test]
    async fn entries_round_trip_within_ttl() {
        let cache = InMemoryCache::new();
        cache
            .set("k", record(json!({"a": 1})), Duration::from_secs(60))
            .await
            .unwrap();
        let hit = cache.get("k").await.unwrap().unwrap();
        assert_eq!(hit.body, json!({"a": 1}));
        assert_eq!(hit.ttl_ms, 60_000);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let cache = InMemoryCache::new();
        cache
            .set("k", record(json!(1)), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidation_by_key_and_pattern() {
        let cache = InMemoryCache::new();
        for key in ["users/1", "users/2", "orders/1"] {
            cache
                .set(key, record(json!(key)), Duration::from_secs(60))
                .await
                .unwrap();
        }

        cache.invalidate("orders/1").await.unwrap();
        assert!(cache.get("orders/1").await.unwrap().is_none());

        let removed = cache.invalidate_by_pattern("users/*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get("users/1").await.unwrap().is_none());
    }

    #[test]
    fn cache_keys_are_stable_and_input_sensitive() {
        let headers: BTreeMap<String, String> =
            [("Accept".to_string(), "application/json".to_string())].into();
        let a = cache_key("fetch", HttpMethod::GET, "http://x/1", &headers, None);
        let b = cache_key("fetch", HttpMethod::GET, "http://x/1", &headers, None);
        let c = cache_key("fetch", HttpMethod::GET, "http://x/2", &headers, None);
        let d = cache_key(
            "fetch",
            HttpMethod::GET,
            "http://x/1",
            &headers,
            Some(&json!({"q": 1})),
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
