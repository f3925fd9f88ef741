//! Caching decorator for any [`Transport`].
//!
//! Adds three things on top of the wrapped transport:
//! - **Deduplication**: concurrent identical calls share one in-flight outcome
//! - **Reuse**: resolved outcomes are replayed until they expire
//! - **Bounds**: an LRU cap on entries and an optional TTL
//!
//! Failures are never retained; the next identical call goes back to the
//! wrapped transport. Operations that mutate remote state bypass the cache
//! unless a per-operation policy says otherwise.

mod policy;

pub use policy::{default_key, is_mutating_op, CachePolicy, KeyFn, DEFAULT_MUTATING_OPS};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::Transport;
use crate::types::{CacheConfig, Result};

type SharedOutcome = Shared<BoxFuture<'static, Result<Value>>>;

/// Counters describing cache activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Calls delegated without any bookkeeping.
    pub bypassed: u64,
    /// Entries dropped by LRU overflow or expiry.
    pub evictions: u64,
    pub entries: usize,
}

struct CacheEntry {
    generation: u64,
    outcome: SharedOutcome,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct CacheState {
    /// `None` when caching is disabled (`max_entries == 0`).
    entries: Option<LruCache<String, CacheEntry>>,
    next_generation: u64,
    disposed: bool,
    stats: CacheStats,
}

impl CacheState {
    /// Stamp or drop the entry for `key` once its outcome is known. A newer
    /// generation under the same key (after `clear`) is left alone.
    fn settle(&mut self, key: &str, generation: u64, ok: bool, ttl: Option<Duration>) {
        let Some(entries) = self.entries.as_mut() else {
            return;
        };
        let current = entries
            .peek(key)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            return;
        }
        if ok {
            if let Some(entry) = entries.peek_mut(key) {
                entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
            }
        } else {
            entries.pop(key);
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let Some(entries) = self.entries.as_mut() else {
            return 0;
        };
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        self.stats.evictions += expired.len() as u64;
        expired.len()
    }
}

/// Transport decorator adding dedup and LRU/TTL reuse.
pub struct CachingTransport<T> {
    inner: Arc<T>,
    ttl: Option<Duration>,
    key_fn: KeyFn,
    policies: HashMap<String, CachePolicy>,
    state: Arc<Mutex<CacheState>>,
    sweeper: Option<CancellationToken>,
}

impl<T> fmt::Debug for CachingTransport<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingTransport")
            .field("ttl", &self.ttl)
            .field("policies", &self.policies)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> CachingTransport<T> {
    /// Wrap `inner` with default key function and policies.
    pub fn new(inner: T, config: CacheConfig) -> Result<Self> {
        Self::builder(inner).config(config).build()
    }

    pub fn builder(inner: T) -> CachingTransportBuilder<T> {
        CachingTransportBuilder {
            inner,
            config: CacheConfig::default(),
            key_fn: None,
            policies: HashMap::new(),
        }
    }

    /// Drop every entry. In-flight callers still receive their outcome.
    pub fn clear(&self) {
        let mut state = self.state();
        if let Some(entries) = state.entries.as_mut() {
            entries.clear();
        }
        tracing::debug!("Cache cleared");
    }

    /// Clear, stop the sweep and pass every later call straight through.
    /// Idempotent. The wrapped transport is left untouched.
    pub fn dispose(&self) {
        {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            if let Some(entries) = state.entries.as_mut() {
                entries.clear();
            }
        }
        if let Some(sweeper) = &self.sweeper {
            sweeper.cancel();
        }
        tracing::debug!("Cache disposed");
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn policy_for(&self, op: &str) -> CachePolicy {
        match self.policies.get(op) {
            Some(policy) => *policy,
            None if is_mutating_op(op) => CachePolicy::Bypass,
            None => CachePolicy::Cache,
        }
    }

    /// Find a live entry for `key` or start a delegate call and store its
    /// in-flight outcome. Hands `args` back when the call should bypass.
    fn lookup_or_start(
        &self,
        key: String,
        op: &str,
        args: Vec<Value>,
    ) -> std::result::Result<SharedOutcome, Vec<Value>> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.disposed {
            return Err(args);
        }
        let Some(entries) = state.entries.as_mut() else {
            return Err(args);
        };

        let now = Instant::now();
        let cached = entries
            .get(&key)
            .map(|entry| (entry.is_expired(now), entry.outcome.clone()));
        match cached {
            Some((false, outcome)) => {
                state.stats.hits += 1;
                return Ok(outcome);
            }
            Some((true, _)) => {
                entries.pop(&key);
                state.stats.evictions += 1;
            }
            None => {}
        }
        state.stats.misses += 1;

        let generation = state.next_generation;
        state.next_generation += 1;

        let inner = Arc::clone(&self.inner);
        let cache = Arc::downgrade(&self.state);
        let ttl = self.ttl;
        let op = op.to_string();
        let settle_key = key.clone();
        let outcome = async move {
            let outcome = inner.submit(&op, args).await;
            settle(&cache, &settle_key, generation, outcome.is_ok(), ttl);
            outcome
        }
        .boxed()
        .shared();

        let evicted = entries.push(
            key,
            CacheEntry {
                generation,
                outcome: outcome.clone(),
                expires_at: None,
            },
        );
        if let Some((evicted_key, _)) = evicted {
            tracing::trace!("Evicted least recently used entry {}", evicted_key);
            state.stats.evictions += 1;
        }
        Ok(outcome)
    }
}

impl<T> CachingTransport<T> {
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            entries: state.entries.as_ref().map_or(0, LruCache::len),
            ..state.stats.clone()
        }
    }
}

impl<T> Drop for CachingTransport<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.cancel();
        }
    }
}

fn settle(
    cache: &Weak<Mutex<CacheState>>,
    key: &str,
    generation: u64,
    ok: bool,
    ttl: Option<Duration>,
) {
    if let Some(cache) = cache.upgrade() {
        cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settle(key, generation, ok, ttl);
    }
}

#[async_trait]
impl<T: Transport + 'static> Transport for CachingTransport<T> {
    async fn submit(&self, op: &str, args: Vec<Value>) -> Result<Value> {
        if self.policy_for(op) == CachePolicy::Bypass {
            self.state().stats.bypassed += 1;
            return self.inner.submit(op, args).await;
        }
        let Some(key) = (self.key_fn)(op, &args) else {
            self.state().stats.bypassed += 1;
            return self.inner.submit(op, args).await;
        };

        match self.lookup_or_start(key, op, args) {
            Ok(outcome) => outcome.await,
            Err(args) => {
                self.state().stats.bypassed += 1;
                self.inner.submit(op, args).await
            }
        }
    }
}

/// Builder for [`CachingTransport`].
pub struct CachingTransportBuilder<T> {
    inner: T,
    config: CacheConfig,
    key_fn: Option<KeyFn>,
    policies: HashMap<String, CachePolicy>,
}

impl<T> fmt::Debug for CachingTransportBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingTransportBuilder")
            .field("config", &self.config)
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> CachingTransportBuilder<T> {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Derive cache keys with `f`. Returning `None` bypasses the cache for
    /// that call.
    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Option<String> + Send + Sync + 'static,
    {
        let key_fn: KeyFn = Arc::new(f);
        self.key_fn = Some(key_fn);
        self
    }

    /// Override the built-in policy for one operation.
    pub fn policy(mut self, op: impl Into<String>, policy: CachePolicy) -> Self {
        self.policies.insert(op.into(), policy);
        self
    }

    /// Build the decorator. Starts the expiry sweep when configured, which
    /// requires a tokio runtime.
    pub fn build(self) -> Result<CachingTransport<T>> {
        self.config.validate()?;
        let entries = NonZeroUsize::new(self.config.max_entries).map(LruCache::new);
        let enabled = entries.is_some();
        let state = Arc::new(Mutex::new(CacheState {
            entries,
            next_generation: 0,
            disposed: false,
            stats: CacheStats::default(),
        }));

        let sweeper = match (enabled, self.config.ttl, self.config.sweep_interval) {
            (true, Some(_), Some(interval)) => {
                Some(spawn_sweeper(Arc::downgrade(&state), interval))
            }
            _ => None,
        };

        Ok(CachingTransport {
            inner: Arc::new(self.inner),
            ttl: self.config.ttl,
            key_fn: self.key_fn.unwrap_or_else(|| Arc::new(default_key) as KeyFn),
            policies: self.policies,
            state,
            sweeper,
        })
    }
}

/// Periodically evict expired entries until cancelled or the cache is gone.
fn spawn_sweeper(state: Weak<Mutex<CacheState>>, period: Duration) -> CancellationToken {
    let stop = CancellationToken::new();
    let stopped = stop.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stopped.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(state) = state.upgrade() else {
                        break;
                    };
                    let evicted = state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .sweep(Instant::now());
                    if evicted > 0 {
                        tracing::debug!("Cache sweep evicted {} expired entries", evicted);
                    }
                }
            }
        }
        tracing::debug!("Cache sweep stopped");
    });
    stop
}
