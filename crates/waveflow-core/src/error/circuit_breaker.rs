//! # Circuit Breaker
//!
//! Per-service-key state machine that prevents cascade failures by
//! short-circuiting calls to endpoints that keep failing.
//!
//! State lives behind the [`CircuitStore`] abstraction so a single
//! process can use exact in-memory semantics while a fleet shares state
//! through a TTL'd key-value store. All mutations go through
//! `compare_and_set`; the breaker runs a bounded-retry optimistic loop on
//! top, which keeps half-open probe admission atomic even when several
//! orchestrators race on the same key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use super::{EngineError, Result};

/// Attempts at a compare-and-set before giving up on a contended key.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Calls are rejected without reaching the executor.
    Open,
    /// A bounded number of probe calls test whether the service recovered.
    HalfOpen,
}

/// Circuit breaker configuration, per task or per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Failures within the rolling window before the circuit opens.
    pub failure_threshold: u32,
    /// Probe successes in half-open state before the circuit closes.
    pub success_threshold: u32,
    /// How long an open circuit rejects before admitting probes.
    pub open_duration_ms: u64,
    /// Concurrent probes admitted while half-open.
    pub half_open_max_probes: u32,
    /// Rolling window for the failure count.
    pub window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_ms: 30_000,
            half_open_max_probes: 1,
            window_ms: 60_000,
        }
    }
}

/// Persistent state for one circuit key.
///
/// Timestamps are absolute so records survive serialization into a shared
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub probes_in_flight: u32,
    pub window_start: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

impl CircuitRecord {
    fn closed(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            probes_in_flight: 0,
            window_start: None,
            opened_at: None,
            last_state_change: now,
        }
    }

    fn open(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Open,
            failure_count: 0,
            success_count: 0,
            probes_in_flight: 0,
            window_start: None,
            opened_at: Some(now),
            last_state_change: now,
        }
    }
}

/// Storage abstraction for circuit state.
///
/// `compare_and_set` must be atomic: it succeeds only when the stored
/// record still equals `expected` (`None` meaning absent).
#[async_trait]
pub trait CircuitStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CircuitRecord>>;

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&CircuitRecord>,
        new: &CircuitRecord,
    ) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<String>>;
}

/// Single-process store with exact semantics via local mutual exclusion.
#[derive(Default)]
pub struct InMemoryCircuitStore {
    records: Mutex<HashMap<String, CircuitRecord>>,
}

impl InMemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CircuitStore for InMemoryCircuitStore {
    async fn get(&self, key: &str) -> Result<Option<CircuitRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&CircuitRecord>,
        new: &CircuitRecord,
    ) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        if records.get(key) == expected {
            records.insert(key.to_string(), new.clone());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let records = self.records.lock().unwrap();
        let mut keys: Vec<String> = records.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Shared store backed by Redis. Records are JSON strings; the
/// compare-and-set runs server-side as a Lua script so concurrent
/// orchestrators cannot double-admit half-open probes.
#[cfg(feature = "redis-store")]
pub struct RedisCircuitStore {
    connection: redis::aio::ConnectionManager,
    prefix: String,
    ttl_ms: u64,
}

#[cfg(feature = "redis-store")]
impl RedisCircuitStore {
    const CAS_SCRIPT: &'static str = r#"
        local current = redis.call('GET', KEYS[1])
        if (current == false and ARGV[1] == '') or current == ARGV[1] then
            redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
            return 1
        end
        return 0
    "#;

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(EngineError::from)?;
        let connection = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(EngineError::from)?;
        Ok(Self {
            connection,
            prefix: "waveflow:circuit:".to_string(),
            ttl_ms: 86_400_000,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[cfg(feature = "redis-store")]
#[async_trait]
impl CircuitStore for RedisCircuitStore {
    async fn get(&self, key: &str) -> Result<Option<CircuitRecord>> {
        use redis::AsyncCommands;
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.get(self.full_key(key)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&CircuitRecord>,
        new: &CircuitRecord,
    ) -> Result<bool> {
        let mut connection = self.connection.clone();
        let expected_json = match expected {
            Some(record) => serde_json::to_string(record)?,
            None => String::new(),
        };
        let new_json = serde_json::to_string(new)?;
        let swapped: i32 = redis::Script::new(Self::CAS_SCRIPT)
            .key(self.full_key(key))
            .arg(expected_json)
            .arg(new_json)
            .arg(self.ttl_ms)
            .invoke_async(&mut connection)
            .await?;
        Ok(swapped == 1)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        use redis::AsyncCommands;
        let mut connection = self.connection.clone();
        let full: Vec<String> = connection.keys(format!("{}*", self.prefix)).await?;
        let mut keys: Vec<String> = full
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Verdict of [`CircuitBreaker::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Proceed with the call; `probe` marks a half-open trial request.
    Allow { probe: bool },
    /// The circuit is open; the caller must fall back or fail the step.
    Reject,
}

/// Health summary for the operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitHealth {
    pub healthy: bool,
    pub open_circuits: Vec<String>,
}

/// Circuit breaker over a [`CircuitStore`].
///
/// One process-wide instance is injected at composition time; per-step
/// configuration is passed on each call so tasks can carry overrides.
pub struct CircuitBreaker {
    store: Arc<dyn CircuitStore>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn CircuitStore>) -> Self {
        Self { store }
    }

    /// Ask whether a call at `key` may proceed.
    pub async fn acquire(
        &self,
        key: &str,
        config: &CircuitBreakerConfig,
    ) -> Result<CircuitDecision> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let current = self.store.get(key).await?;
            let record = current
                .clone()
                .unwrap_or_else(|| CircuitRecord::closed(now));

            match record.state {
                CircuitState::Closed => return Ok(CircuitDecision::Allow { probe: false }),
                CircuitState::Open => {
                    let opened = record.opened_at.unwrap_or(record.last_state_change);
                    let elapsed = now.signed_duration_since(opened);
                    if elapsed < ChronoDuration::milliseconds(config.open_duration_ms as i64) {
                        return Ok(CircuitDecision::Reject);
                    }
                    // Open duration elapsed: admit exactly one probe by
                    // transitioning to half-open atomically.
                    let mut next = record.clone();
                    next.state = CircuitState::HalfOpen;
                    next.success_count = 0;
                    next.probes_in_flight = 1;
                    next.last_state_change = now;
                    if self
                        .store
                        .compare_and_set(key, current.as_ref(), &next)
                        .await?
                    {
                        tracing::info!(key, "circuit transitioned to half-open");
                        return Ok(CircuitDecision::Allow { probe: true });
                    }
                }
                CircuitState::HalfOpen => {
                    if record.probes_in_flight >= config.half_open_max_probes {
                        return Ok(CircuitDecision::Reject);
                    }
                    let mut next = record.clone();
                    next.probes_in_flight += 1;
                    if self
                        .store
                        .compare_and_set(key, current.as_ref(), &next)
                        .await?
                    {
                        return Ok(CircuitDecision::Allow { probe: true });
                    }
                }
            }
        }
        // Contended past the retry bound; rejecting is the safe side.
        tracing::warn!(key, "circuit CAS contention, rejecting call");
        Ok(CircuitDecision::Reject)
    }

    /// Record a successful call outcome at `key`.
    pub async fn record_success(&self, key: &str, config: &CircuitBreakerConfig) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let current = self.store.get(key).await?;
            let record = current
                .clone()
                .unwrap_or_else(|| CircuitRecord::closed(now));

            let next = match record.state {
                CircuitState::HalfOpen => {
                    let mut next = record.clone();
                    next.success_count += 1;
                    next.probes_in_flight = next.probes_in_flight.saturating_sub(1);
                    if next.success_count >= config.success_threshold {
                        tracing::info!(key, "circuit closed after successful probes");
                        CircuitRecord::closed(now)
                    } else {
                        next
                    }
                }
                CircuitState::Closed => {
                    let mut next = record.clone();
                    next.failure_count = 0;
                    next.window_start = None;
                    next
                }
                // Stale success racing a forced open; nothing to update.
                CircuitState::Open => return Ok(()),
            };

            if self
                .store
                .compare_and_set(key, current.as_ref(), &next)
                .await?
            {
                return Ok(());
            }
        }
        tracing::warn!(key, "circuit CAS contention, dropping success record");
        Ok(())
    }

    /// Record a failed call outcome at `key`.
    pub async fn record_failure(&self, key: &str, config: &CircuitBreakerConfig) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let current = self.store.get(key).await?;
            let record = current
                .clone()
                .unwrap_or_else(|| CircuitRecord::closed(now));

            let next = match record.state {
                // A failed probe reopens the circuit and resets the timer.
                CircuitState::HalfOpen => {
                    tracing::warn!(key, "probe failed, circuit reopened");
                    CircuitRecord::open(now)
                }
                CircuitState::Closed => {
                    let window = ChronoDuration::milliseconds(config.window_ms as i64);
                    let in_window = record
                        .window_start
                        .map(|start| now.signed_duration_since(start) <= window)
                        .unwrap_or(false);
                    let mut next = record.clone();
                    if in_window {
                        next.failure_count += 1;
                    } else {
                        next.failure_count = 1;
                        next.window_start = Some(now);
                    }
                    if next.failure_count >= config.failure_threshold {
                        tracing::warn!(
                            key,
                            failures = next.failure_count,
                            "failure threshold reached, circuit opened"
                        );
                        CircuitRecord::open(now)
                    } else {
                        next
                    }
                }
                CircuitState::Open => return Ok(()),
            };

            if self
                .store
                .compare_and_set(key, current.as_ref(), &next)
                .await?
            {
                return Ok(());
            }
        }
        tracing::warn!(key, "circuit CAS contention, dropping failure record");
        Ok(())
    }

    // --- operator surface; every operation is idempotent ---

    /// All tracked circuits with their records.
    pub async fn list(&self) -> Result<Vec<(String, CircuitRecord)>> {
        let mut entries = Vec::new();
        for key in self.store.keys().await? {
            if let Some(record) = self.store.get(&key).await? {
                entries.push((key, record));
            }
        }
        Ok(entries)
    }

    /// The record for one circuit, if tracked.
    pub async fn get(&self, key: &str) -> Result<Option<CircuitRecord>> {
        self.store.get(key).await
    }

    /// Force the circuit open regardless of its counters.
    pub async fn force_open(&self, key: &str) -> Result<()> {
        self.set_unconditionally(key, CircuitRecord::open(Utc::now()))
            .await
    }

    /// Force the circuit closed regardless of its counters.
    pub async fn force_close(&self, key: &str) -> Result<()> {
        self.set_unconditionally(key, CircuitRecord::closed(Utc::now()))
            .await
    }

    /// Return the circuit to Closed with zeroed counters.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.force_close(key).await
    }

    /// Overall breaker health: healthy iff no circuit is open.
    pub async fn health(&self) -> Result<CircuitHealth> {
        let mut open_circuits = Vec::new();
        for (key, record) in self.list().await? {
            if record.state == CircuitState::Open {
                open_circuits.push(key);
            }
        }
        Ok(CircuitHealth {
            healthy: open_circuits.is_empty(),
            open_circuits,
        })
    }

    async fn set_unconditionally(&self, key: &str, new: CircuitRecord) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(key).await?;
            if self
                .store
                .compare_and_set(key, current.as_ref(), &new)
                .await?
            {
                return Ok(());
            }
        }
        Err(EngineError::Internal {
            message: format!("circuit store contention while updating '{}'", key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Arc::new(InMemoryCircuitStore::new()))
    }

    fn config(failure_threshold: u32, open_duration_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            open_duration_ms,
            half_open_max_probes: 1,
            window_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let cb = breaker();
        let cfg = config(2, 30_000);

        cb.record_failure("svc", &cfg).await.unwrap();
        assert_eq!(
            cb.acquire("svc", &cfg).await.unwrap(),
            CircuitDecision::Allow { probe: false }
        );

        cb.record_failure("svc", &cfg).await.unwrap();
        assert_eq!(cb.acquire("svc", &cfg).await.unwrap(), CircuitDecision::Reject);
        assert_eq!(cb.get("svc").await.unwrap().unwrap().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_admits_bounded_probes_then_closes() {
        let cb = breaker();
        let cfg = config(1, 20);

        cb.record_failure("svc", &cfg).await.unwrap();
        assert_eq!(cb.acquire("svc", &cfg).await.unwrap(), CircuitDecision::Reject);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // First acquire after the open duration is the single probe.
        assert_eq!(
            cb.acquire("svc", &cfg).await.unwrap(),
            CircuitDecision::Allow { probe: true }
        );
        // Second concurrent probe is rejected.
        assert_eq!(cb.acquire("svc", &cfg).await.unwrap(), CircuitDecision::Reject);

        cb.record_success("svc", &cfg).await.unwrap();
        assert_eq!(
            cb.get("svc").await.unwrap().unwrap().state,
            CircuitState::Closed
        );
        assert_eq!(
            cb.acquire("svc", &cfg).await.unwrap(),
            CircuitDecision::Allow { probe: false }
        );
    }

    #[tokio::test]
    async fn recovery_needs_the_configured_probe_successes() {
        let cb = breaker();
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            open_duration_ms: 10,
            half_open_max_probes: 1,
            window_ms: 60_000,
        };

        cb.record_failure("svc", &cfg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            cb.acquire("svc", &cfg).await.unwrap(),
            CircuitDecision::Allow { probe: true }
        );
        cb.record_success("svc", &cfg).await.unwrap();
        // One success is not enough yet.
        assert_eq!(
            cb.get("svc").await.unwrap().unwrap().state,
            CircuitState::HalfOpen
        );

        assert_eq!(
            cb.acquire("svc", &cfg).await.unwrap(),
            CircuitDecision::Allow { probe: true }
        );
        cb.record_success("svc", &cfg).await.unwrap();
        assert_eq!(
            cb.get("svc").await.unwrap().unwrap().state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let cb = breaker();
        let cfg = config(1, 10);

        cb.record_failure("svc", &cfg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            cb.acquire("svc", &cfg).await.unwrap(),
            CircuitDecision::Allow { probe: true }
        );

        cb.record_failure("svc", &cfg).await.unwrap();
        let record = cb.get("svc").await.unwrap().unwrap();
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(cb.acquire("svc", &cfg).await.unwrap(), CircuitDecision::Reject);
    }

    #[tokio::test]
    async fn failures_outside_window_do_not_accumulate() {
        let cb = breaker();
        let cfg = CircuitBreakerConfig {
            failure_threshold: 2,
            window_ms: 20,
            ..CircuitBreakerConfig::default()
        };

        cb.record_failure("svc", &cfg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cb.record_failure("svc", &cfg).await.unwrap();

        let record = cb.get("svc").await.unwrap().unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count, 1);
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failure_count() {
        let cb = breaker();
        let cfg = config(3, 30_000);

        cb.record_failure("svc", &cfg).await.unwrap();
        cb.record_failure("svc", &cfg).await.unwrap();
        cb.record_success("svc", &cfg).await.unwrap();
        cb.record_failure("svc", &cfg).await.unwrap();
        cb.record_failure("svc", &cfg).await.unwrap();

        assert_eq!(
            cb.get("svc").await.unwrap().unwrap().state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn admin_operations_are_idempotent() {
        let cb = breaker();
        let cfg = CircuitBreakerConfig::default();

        cb.force_open("svc").await.unwrap();
        cb.force_open("svc").await.unwrap();
        assert_eq!(cb.get("svc").await.unwrap().unwrap().state, CircuitState::Open);

        let health = cb.health().await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.open_circuits, vec!["svc".to_string()]);

        cb.reset("svc").await.unwrap();
        let record = cb.get("svc").await.unwrap().unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.success_count, 0);
        assert_eq!(
            cb.acquire("svc", &cfg).await.unwrap(),
            CircuitDecision::Allow { probe: false }
        );
        assert!(cb.health().await.unwrap().healthy);
    }
}
