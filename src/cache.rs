//! LRU + TTL cache for successful responses
//!
//! Keys are derived deterministically from the request envelope (method, host,
//! port, path, ordered query, authorization header, body hash) unless the
//! caller supplies a key function. Only configured success statuses are
//! stored; excluded methods bypass the cache on both read and write.

use crate::clock::{Clock, MonotonicClock};
use crate::http::{HttpCall, HttpResponse, Method};
use crate::persistence::StatePersistence;
use lru::LruCache;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Caller-supplied cache key derivation.
pub type CacheKeyFn = Arc<dyn Fn(&HttpCall) -> String + Send + Sync>;

/// Cache behavior knobs.
#[derive(Clone)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub max_size: usize,
    /// When set, `Cache-Control` / `Expires` response headers win over the
    /// configured TTL.
    pub respect_cache_control: bool,
    pub cacheable_statuses: HashSet<u16>,
    pub excluded_methods: HashSet<Method>,
    pub key_fn: Option<CacheKeyFn>,
}

impl CachePolicy {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size,
            respect_cache_control: true,
            cacheable_statuses: Self::default_statuses(),
            excluded_methods: Self::default_excluded_methods(),
            key_fn: None,
        }
    }

    /// 2xx plus 304.
    pub fn default_statuses() -> HashSet<u16> {
        let mut set: HashSet<u16> = (200..300).collect();
        set.insert(304);
        set
    }

    pub fn default_excluded_methods() -> HashSet<Method> {
        [Method::Post, Method::Put, Method::Patch, Method::Delete]
            .into_iter()
            .collect()
    }

    pub fn with_key_fn(mut self, key_fn: CacheKeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }
}

impl std::fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .field("max_size", &self.max_size)
            .field("respect_cache_control", &self.respect_cache_control)
            .field("key_fn", &self.key_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// One stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Value,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub inserted_at_ms: u64,
    pub expires_at_ms: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
}

/// Shared response cache. Thread-safe; clone the `Arc` to share across
/// gateways and workflows.
pub struct ContentCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    policy: CachePolicy,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    name: String,
    persistence: Option<Arc<dyn StatePersistence>>,
}

impl ContentCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self::with_clock(policy, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(policy: CachePolicy, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(policy.max_size.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            policy,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            name: "cache".to_string(),
            persistence: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Save live entries with their remaining TTLs; failures are logged.
    pub async fn persist(&self) {
        let Some(persistence) = &self.persistence else { return };
        let now = self.clock.now_millis();
        let snapshot: Vec<Value> = {
            let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries
                .iter()
                .filter(|(_, entry)| entry.expires_at_ms > now)
                .map(|(key, entry)| {
                    serde_json::json!({
                        "key": key,
                        "body": entry.body,
                        "status": entry.status,
                        "headers": entry.headers,
                        "remaining_ms": entry.expires_at_ms - now,
                    })
                })
                .collect()
        };
        let value = Value::Array(snapshot);
        if let Err(e) = persistence.store(&format!("cache.{}", self.name), value).await {
            tracing::warn!(cache = %self.name, error = %e, "cache persist failed");
        }
    }

    /// Restore persisted entries whose TTL has not run out, preserving
    /// recency order.
    pub async fn hydrate(&self) {
        let Some(persistence) = &self.persistence else { return };
        let loaded = match persistence.load(&format!("cache.{}", self.name)).await {
            Ok(Some(Value::Array(items))) => items,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(cache = %self.name, error = %e, "cache hydrate failed");
                return;
            }
        };
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        // Snapshots list most-recent first; push in reverse to rebuild order.
        for item in loaded.iter().rev() {
            let Some(key) = item.get("key").and_then(|k| k.as_str()) else { continue };
            let Some(remaining) = item.get("remaining_ms").and_then(|r| r.as_u64()) else {
                continue;
            };
            let headers: BTreeMap<String, String> = item
                .get("headers")
                .and_then(|h| serde_json::from_value(h.clone()).ok())
                .unwrap_or_default();
            entries.push(
                key.to_string(),
                CacheEntry {
                    body: item.get("body").cloned().unwrap_or(Value::Null),
                    status: item.get("status").and_then(|s| s.as_u64()).unwrap_or(200) as u16,
                    headers,
                    inserted_at_ms: now,
                    expires_at_ms: now.saturating_add(remaining),
                },
            );
        }
    }

    pub fn shared(policy: CachePolicy) -> Arc<Self> {
        Arc::new(Self::new(policy))
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Deterministic key for an envelope: method, host, port, path, ordered
    /// query, authorization header, and a body hash.
    pub fn derive_key(&self, call: &HttpCall) -> String {
        if let Some(key_fn) = &self.policy.key_fn {
            return key_fn(call);
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        call.method.as_str().hash(&mut hasher);
        call.hostname.hash(&mut hasher);
        call.port().hash(&mut hasher);
        call.path.hash(&mut hasher);
        for (k, v) in &call.query {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        if let Some(auth) = call
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
            .map(|(_, v)| v)
        {
            auth.hash(&mut hasher);
        }
        if let Some(body) = &call.body {
            body.to_string().hash(&mut hasher);
        }
        format!("{}:{}{}#{:016x}", call.method.as_str(), call.hostname, call.path, hasher.finish())
    }

    /// Whether the envelope is eligible for cache consultation at all.
    pub fn admits(&self, call: &HttpCall) -> bool {
        !self.policy.excluded_methods.contains(&call.method)
    }

    /// Fetch an unexpired entry; expired entries are dropped on the way out.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at_ms > now => {
                let hit = entry.clone();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(hit);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response if policy admits it. Returns whether it was stored.
    pub fn store(&self, call: &HttpCall, response: &HttpResponse) -> bool {
        if !self.admits(call) || !self.policy.cacheable_statuses.contains(&response.status) {
            return false;
        }
        let Some(ttl) = self.effective_ttl(response) else {
            return false;
        };
        let now = self.clock.now_millis();
        let entry = CacheEntry {
            body: response.body.clone(),
            status: response.status,
            headers: response.headers.clone(),
            inserted_at_ms: now,
            expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
        };
        let key = self.derive_key(call);
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let at_capacity = entries.len() == entries.cap().get() && !entries.contains(&key);
        if at_capacity {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.push(key, entry);
        self.insertions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// TTL for this response, or `None` when caching is forbidden.
    ///
    /// `Cache-Control` directives win over `Expires`, which wins over the
    /// configured TTL, all of it only when `respect_cache_control` is on.
    fn effective_ttl(&self, response: &HttpResponse) -> Option<Duration> {
        if !self.policy.respect_cache_control {
            return Some(self.policy.ttl);
        }
        if let Some(cc) = response.header("cache-control") {
            for directive in cc.split(',') {
                let directive = directive.trim().to_ascii_lowercase();
                if directive == "no-cache" || directive == "no-store" {
                    return None;
                }
                if let Some(age) = directive.strip_prefix("max-age=") {
                    let secs: u64 = age.parse().ok()?;
                    if secs == 0 {
                        return None;
                    }
                    return Some(Duration::from_secs(secs));
                }
            }
        }
        if let Some(expires) = response.header("expires") {
            if let Ok(when) = chrono::DateTime::parse_from_rfc2822(expires) {
                let remaining = when.timestamp_millis() - self.clock.epoch_millis();
                if remaining <= 0 {
                    return None;
                }
                return Some(Duration::from_millis(remaining as u64));
            }
        }
        Some(self.policy.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            max_size: self.policy.max_size,
        }
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("policy", &self.policy)
            .field("size", &self.len())
            .finish()
    }
}
