//! Shared infrastructure bundle
//!
//! Any level (leaf, group, phase, branch, workflow, scheduler) may inject
//! pre-built primitives; whatever is absent is either inherited from the
//! parent level or left off entirely. Injected primitives outlive the run
//! and keep accumulating metrics.

use crate::breaker::{BreakerMetrics, CircuitBreaker};
use crate::cache::{CacheMetrics, ContentCache};
use crate::concurrency::{ConcurrencyLimiter, ConcurrencyMetrics};
use crate::rate_limit::{RateLimiter, RateLimiterMetrics};
use std::sync::Arc;

/// The primitives an attempt consults, all optional.
#[derive(Clone, Default)]
pub struct Infra {
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub concurrency: Option<Arc<ConcurrencyLimiter>>,
    pub cache: Option<Arc<ContentCache>>,
}

/// Combined snapshot across whichever primitives are present.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct InfraMetrics {
    pub breaker: Option<BreakerMetrics>,
    pub rate_limiter: Option<RateLimiterMetrics>,
    pub concurrency: Option<ConcurrencyMetrics>,
    pub cache: Option<CacheMetrics>,
}

impl Infra {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_concurrency(mut self, limiter: Arc<ConcurrencyLimiter>) -> Self {
        self.concurrency = Some(limiter);
        self
    }

    pub fn with_cache(mut self, cache: Arc<ContentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Fill gaps from a parent bundle; set fields shadow inherited ones.
    pub fn inherit(&self, parent: &Infra) -> Infra {
        Infra {
            breaker: self.breaker.clone().or_else(|| parent.breaker.clone()),
            rate_limiter: self.rate_limiter.clone().or_else(|| parent.rate_limiter.clone()),
            concurrency: self.concurrency.clone().or_else(|| parent.concurrency.clone()),
            cache: self.cache.clone().or_else(|| parent.cache.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.breaker.is_none()
            && self.rate_limiter.is_none()
            && self.concurrency.is_none()
            && self.cache.is_none()
    }

    pub fn metrics(&self) -> InfraMetrics {
        InfraMetrics {
            breaker: self.breaker.as_ref().map(|b| b.metrics()),
            rate_limiter: self.rate_limiter.as_ref().map(|r| r.metrics()),
            concurrency: self.concurrency.as_ref().map(|c| c.metrics()),
            cache: self.cache.as_ref().map(|c| c.metrics()),
        }
    }
}

impl std::fmt::Debug for Infra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Infra")
            .field("breaker", &self.breaker.is_some())
            .field("rate_limiter", &self.rate_limiter.is_some())
            .field("concurrency", &self.concurrency.is_some())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}
