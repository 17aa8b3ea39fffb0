//! Distributed coordination contract
//!
//! The orchestrator never talks to Redis/Postgres/etcd directly; it talks to
//! this trait. Locks carry fencing tokens, keys are versioned for
//! compare-and-swap, leadership honors the backend's quorum contract, and
//! pub/sub declares a delivery mode. The in-memory implementation backs
//! single-process deployments and the test suite.

use crate::clock::{Clock, MonotonicClock};
use crate::metrics::DistributedMetrics;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Backend failure; callers decide whether to retry or degrade.
#[derive(Debug, thiserror::Error)]
#[error("distributed adapter failed: {message}")]
pub struct AdapterError {
    pub message: String,
}

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// A held lock. The fencing token increases monotonically per key so stale
/// holders can be rejected by downstream writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub key: String,
    pub fencing_token: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub value: Value,
    pub version: u64,
}

/// Outcome of a leadership campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignOutcome {
    Elected { term: u64 },
    Follower { leader: String },
    /// The backend could not assemble a quorum.
    NoQuorum,
}

impl CampaignOutcome {
    pub fn is_elected(&self) -> bool {
        matches!(self, CampaignOutcome::Elected { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// One step of a staged transaction.
#[derive(Debug, Clone)]
pub enum KvOp {
    Set { key: String, value: Value },
    Delete { key: String },
    CompareAndSwap { key: String, expected_version: Option<u64>, value: Value },
}

/// Pub/sub receive side.
pub struct Subscription {
    rx: tokio::sync::broadcast::Receiver<Value>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait DistributedAdapter: Send + Sync {
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockGrant>, AdapterError>;

    async fn release_lock(&self, key: &str, fencing_token: u64) -> Result<bool, AdapterError>;

    async fn extend_lock(
        &self,
        key: &str,
        fencing_token: u64,
        ttl: Duration,
    ) -> Result<bool, AdapterError>;

    async fn kv_get(&self, key: &str) -> Result<Option<VersionedValue>, AdapterError>;

    async fn kv_set(&self, key: &str, value: Value) -> Result<u64, AdapterError>;

    async fn kv_delete(&self, key: &str) -> Result<bool, AdapterError>;

    async fn kv_compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> Result<bool, AdapterError>;

    async fn counter_add(&self, key: &str, delta: i64) -> Result<i64, AdapterError>;

    async fn campaign(
        &self,
        group: &str,
        candidate: &str,
        lease: Duration,
    ) -> Result<CampaignOutcome, AdapterError>;

    /// Refresh the lease; `false` means leadership was lost.
    async fn heartbeat(&self, group: &str, candidate: &str) -> Result<bool, AdapterError>;

    async fn resign(&self, group: &str, candidate: &str) -> Result<(), AdapterError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        mode: DeliveryMode,
    ) -> Result<(), AdapterError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, AdapterError>;

    /// All-or-nothing application of staged operations.
    async fn transact(&self, ops: Vec<KvOp>) -> Result<bool, AdapterError>;

    fn metrics(&self) -> DistributedMetrics;
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    holder: String,
    token: u64,
    expires_at_ms: u64,
    lease_ms: u64,
}

/// Single-process adapter with real fencing, versioning, and lease
/// semantics. Quorum can be toggled off to simulate a partition.
pub struct InMemoryAdapter {
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, LeaseEntry>>,
    fencing: AtomicU64,
    kv: Mutex<HashMap<String, VersionedValue>>,
    counters: Mutex<HashMap<String, i64>>,
    leaders: Mutex<HashMap<String, LeaseEntry>>,
    terms: AtomicU64,
    topics: Mutex<HashMap<String, tokio::sync::broadcast::Sender<Value>>>,
    quorum_available: AtomicBool,
    locks_acquired: AtomicU64,
    locks_released: AtomicU64,
    campaigns: AtomicU64,
    leadership_changes: AtomicU64,
    publishes: AtomicU64,
    deliveries: AtomicU64,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            locks: Mutex::new(HashMap::new()),
            fencing: AtomicU64::new(0),
            kv: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            leaders: Mutex::new(HashMap::new()),
            terms: AtomicU64::new(0),
            topics: Mutex::new(HashMap::new()),
            quorum_available: AtomicBool::new(true),
            locks_acquired: AtomicU64::new(0),
            locks_released: AtomicU64::new(0),
            campaigns: AtomicU64::new(0),
            leadership_changes: AtomicU64::new(0),
            publishes: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate a partition: campaigns fail and heartbeats report loss.
    pub fn set_quorum_available(&self, available: bool) {
        self.quorum_available.store(available, Ordering::SeqCst);
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedAdapter for InMemoryAdapter {
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockGrant>, AdapterError> {
        let now = self.now();
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = locks.get(key) {
            if existing.expires_at_ms > now {
                return Ok(None);
            }
        }
        let token = self.fencing.fetch_add(1, Ordering::SeqCst) + 1;
        let lease_ms = ttl.as_millis() as u64;
        let expires_at_ms = now + lease_ms;
        locks.insert(
            key.to_string(),
            LeaseEntry { holder: String::new(), token, expires_at_ms, lease_ms },
        );
        self.locks_acquired.fetch_add(1, Ordering::Relaxed);
        Ok(Some(LockGrant { key: key.to_string(), fencing_token: token, expires_at_ms }))
    }

    async fn release_lock(&self, key: &str, fencing_token: u64) -> Result<bool, AdapterError> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        match locks.get(key) {
            Some(entry) if entry.token == fencing_token => {
                locks.remove(key);
                self.locks_released.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_lock(
        &self,
        key: &str,
        fencing_token: u64,
        ttl: Duration,
    ) -> Result<bool, AdapterError> {
        let now = self.now();
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        match locks.get_mut(key) {
            Some(entry) if entry.token == fencing_token && entry.expires_at_ms > now => {
                entry.expires_at_ms = now + ttl.as_millis() as u64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn kv_get(&self, key: &str) -> Result<Option<VersionedValue>, AdapterError> {
        Ok(self.kv.lock().unwrap_or_else(|p| p.into_inner()).get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: Value) -> Result<u64, AdapterError> {
        let mut kv = self.kv.lock().unwrap_or_else(|p| p.into_inner());
        let version = kv.get(key).map(|v| v.version + 1).unwrap_or(1);
        kv.insert(key.to_string(), VersionedValue { value, version });
        Ok(version)
    }

    async fn kv_delete(&self, key: &str) -> Result<bool, AdapterError> {
        Ok(self.kv.lock().unwrap_or_else(|p| p.into_inner()).remove(key).is_some())
    }

    async fn kv_compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> Result<bool, AdapterError> {
        let mut kv = self.kv.lock().unwrap_or_else(|p| p.into_inner());
        let current = kv.get(key).map(|v| v.version);
        if current != expected_version {
            return Ok(false);
        }
        let version = current.unwrap_or(0) + 1;
        kv.insert(key.to_string(), VersionedValue { value, version });
        Ok(true)
    }

    async fn counter_add(&self, key: &str, delta: i64) -> Result<i64, AdapterError> {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let entry = counters.entry(key.to_string()).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    async fn campaign(
        &self,
        group: &str,
        candidate: &str,
        lease: Duration,
    ) -> Result<CampaignOutcome, AdapterError> {
        self.campaigns.fetch_add(1, Ordering::Relaxed);
        if !self.quorum_available.load(Ordering::SeqCst) {
            return Ok(CampaignOutcome::NoQuorum);
        }
        let now = self.now();
        let mut leaders = self.leaders.lock().unwrap_or_else(|p| p.into_inner());
        let (changed, previous_term) = match leaders.get(group) {
            Some(entry) if entry.expires_at_ms > now && entry.holder != candidate => {
                return Ok(CampaignOutcome::Follower { leader: entry.holder.clone() });
            }
            Some(entry) if entry.holder == candidate && entry.expires_at_ms > now => {
                (false, entry.token)
            }
            Some(entry) => (true, entry.token),
            None => (true, 0),
        };
        let term = if changed {
            self.terms.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            previous_term
        };
        let lease_ms = lease.as_millis() as u64;
        leaders.insert(
            group.to_string(),
            LeaseEntry {
                holder: candidate.to_string(),
                token: term,
                expires_at_ms: now + lease_ms,
                lease_ms,
            },
        );
        if changed {
            self.leadership_changes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(CampaignOutcome::Elected { term })
    }

    async fn heartbeat(&self, group: &str, candidate: &str) -> Result<bool, AdapterError> {
        if !self.quorum_available.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let now = self.now();
        let mut leaders = self.leaders.lock().unwrap_or_else(|p| p.into_inner());
        match leaders.get_mut(group) {
            Some(entry) if entry.holder == candidate && entry.expires_at_ms > now => {
                entry.expires_at_ms = now + entry.lease_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resign(&self, group: &str, candidate: &str) -> Result<(), AdapterError> {
        let mut leaders = self.leaders.lock().unwrap_or_else(|p| p.into_inner());
        if leaders.get(group).map(|e| e.holder == candidate).unwrap_or(false) {
            leaders.remove(group);
            self.leadership_changes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        _mode: DeliveryMode,
    ) -> Result<(), AdapterError> {
        self.publishes.fetch_add(1, Ordering::Relaxed);
        let topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(sender) = topics.get(topic) {
            let delivered = sender.send(payload).unwrap_or(0);
            self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, AdapterError> {
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| tokio::sync::broadcast::channel(64).0);
        Ok(Subscription { rx: sender.subscribe() })
    }

    async fn transact(&self, ops: Vec<KvOp>) -> Result<bool, AdapterError> {
        let mut kv = self.kv.lock().unwrap_or_else(|p| p.into_inner());
        // Prepare: every CAS must pass against the current view.
        for op in &ops {
            if let KvOp::CompareAndSwap { key, expected_version, .. } = op {
                if kv.get(key).map(|v| v.version) != *expected_version {
                    return Ok(false);
                }
            }
        }
        // Commit.
        for op in ops {
            match op {
                KvOp::Set { key, value } | KvOp::CompareAndSwap { key, value, .. } => {
                    let version = kv.get(&key).map(|v| v.version + 1).unwrap_or(1);
                    kv.insert(key, VersionedValue { value, version });
                }
                KvOp::Delete { key } => {
                    kv.remove(&key);
                }
            }
        }
        Ok(true)
    }

    fn metrics(&self) -> DistributedMetrics {
        DistributedMetrics {
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            campaigns: self.campaigns.load(Ordering::Relaxed),
            leadership_changes: self.leadership_changes.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    #[tokio::test]
    async fn lock_fencing_tokens_increase() {
        let clock = ManualClock::new();
        let adapter = InMemoryAdapter::with_clock(Arc::new(clock.clone()));
        let a = adapter.acquire_lock("job", Duration::from_millis(100)).await.unwrap().unwrap();
        // Held: second acquire fails.
        assert!(adapter.acquire_lock("job", Duration::from_millis(100)).await.unwrap().is_none());
        // Expired: new grant with a larger token.
        clock.advance(150);
        let b = adapter.acquire_lock("job", Duration::from_millis(100)).await.unwrap().unwrap();
        assert!(b.fencing_token > a.fencing_token);
        // The stale holder cannot release the new grant.
        assert!(!adapter.release_lock("job", a.fencing_token).await.unwrap());
        assert!(adapter.release_lock("job", b.fencing_token).await.unwrap());
    }

    #[tokio::test]
    async fn extend_requires_live_matching_token() {
        let clock = ManualClock::new();
        let adapter = InMemoryAdapter::with_clock(Arc::new(clock.clone()));
        let grant =
            adapter.acquire_lock("job", Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(adapter
            .extend_lock("job", grant.fencing_token, Duration::from_millis(200))
            .await
            .unwrap());
        clock.advance(300);
        assert!(!adapter
            .extend_lock("job", grant.fencing_token, Duration::from_millis(200))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cas_enforces_versions() {
        let adapter = InMemoryAdapter::new();
        assert!(adapter.kv_compare_and_swap("k", None, json!(1)).await.unwrap());
        let v1 = adapter.kv_get("k").await.unwrap().unwrap();
        assert_eq!(v1.version, 1);
        // Stale expectation loses.
        assert!(!adapter.kv_compare_and_swap("k", None, json!(2)).await.unwrap());
        assert!(adapter.kv_compare_and_swap("k", Some(1), json!(2)).await.unwrap());
        assert_eq!(adapter.kv_get("k").await.unwrap().unwrap().value, json!(2));
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let adapter = InMemoryAdapter::new();
        assert_eq!(adapter.counter_add("n", 5).await.unwrap(), 5);
        assert_eq!(adapter.counter_add("n", -2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn campaign_elects_one_leader() {
        let adapter = InMemoryAdapter::new();
        let lease = Duration::from_secs(10);
        assert!(adapter.campaign("group", "a", lease).await.unwrap().is_elected());
        match adapter.campaign("group", "b", lease).await.unwrap() {
            CampaignOutcome::Follower { leader } => assert_eq!(leader, "a"),
            other => panic!("expected follower, got {:?}", other),
        }
        assert!(adapter.heartbeat("group", "a").await.unwrap());
        assert!(!adapter.heartbeat("group", "b").await.unwrap());
        adapter.resign("group", "a").await.unwrap();
        assert!(adapter.campaign("group", "b", lease).await.unwrap().is_elected());
    }

    #[tokio::test]
    async fn lost_quorum_blocks_campaigns_and_heartbeats() {
        let adapter = InMemoryAdapter::new();
        let lease = Duration::from_secs(10);
        assert!(adapter.campaign("group", "a", lease).await.unwrap().is_elected());
        adapter.set_quorum_available(false);
        assert_eq!(
            adapter.campaign("group", "b", lease).await.unwrap(),
            CampaignOutcome::NoQuorum
        );
        assert!(!adapter.heartbeat("group", "a").await.unwrap());
        adapter.set_quorum_available(true);
        assert!(adapter.heartbeat("group", "a").await.unwrap());
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscribers() {
        let adapter = InMemoryAdapter::new();
        let mut sub = adapter.subscribe("events").await.unwrap();
        adapter
            .publish("events", json!({"kind": "tick"}), DeliveryMode::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(sub.recv().await, Some(json!({"kind": "tick"})));
        let metrics = adapter.metrics();
        assert_eq!(metrics.publishes, 1);
        assert_eq!(metrics.deliveries, 1);
    }

    #[tokio::test]
    async fn transactions_are_all_or_nothing() {
        let adapter = InMemoryAdapter::new();
        adapter.kv_set("a", json!(1)).await.unwrap();
        let applied = adapter
            .transact(vec![
                KvOp::Set { key: "b".into(), value: json!(2) },
                KvOp::CompareAndSwap {
                    key: "a".into(),
                    expected_version: Some(99),
                    value: json!(3),
                },
            ])
            .await
            .unwrap();
        assert!(!applied);
        // Nothing from the failed transaction landed.
        assert!(adapter.kv_get("b").await.unwrap().is_none());

        let applied = adapter
            .transact(vec![
                KvOp::Set { key: "b".into(), value: json!(2) },
                KvOp::CompareAndSwap {
                    key: "a".into(),
                    expected_version: Some(1),
                    value: json!(3),
                },
            ])
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(adapter.kv_get("b").await.unwrap().unwrap().value, json!(2));
        assert_eq!(adapter.kv_get("a").await.unwrap().unwrap().value, json!(3));
    }
}
