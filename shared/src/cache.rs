//! Keyed request cache with single-flight fetches.
//!
//! A fresh entry is served as-is. While a fetch for a key is running, every
//! other caller for that key awaits the same shared future instead of calling
//! its own producer. Failures are handed to all of those callers and never
//! stored; a panicking producer counts as an internal failure. Expiry is
//! checked on read; there is no background sweep.

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::{
    AppError, AppResult, ConfigError, ErrorKind, DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_TTL,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: u64::try_from(DEFAULT_CACHE_TTL.as_millis()).unwrap_or(u64::MAX),
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl_ms == 0 {
            return Err(ConfigError::MustBePositive {
                field: "default_ttl_ms",
            });
        }
        if self.max_entries == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_entries",
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

/// A stored fetch result. Replaced wholesale on refetch, never edited.
#[derive(Clone, Debug)]
pub struct CacheEntry<K, T> {
    pub key: K,
    pub value: T,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl<K, T> CacheEntry<K, T> {
    #[must_use]
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }
}

type SharedFetch<T> = Shared<BoxFuture<'static, AppResult<T>>>;

/// The in-flight fetch for one key.
///
/// `generation` tells a settling fetch whether it is still the current one
/// or was superseded by an invalidation.
#[derive(Clone)]
pub struct PendingFetch<T: Clone> {
    generation: u64,
    future: SharedFetch<T>,
}

impl<T: Clone> PendingFetch<T> {
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

struct CacheState<K: Hash + Eq, T: Clone> {
    entries: LruCache<K, CacheEntry<K, T>>,
    pending: HashMap<K, PendingFetch<T>>,
    next_generation: u64,
}

impl<K: Hash + Eq, T: Clone> CacheState<K, T> {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            pending: HashMap::new(),
            next_generation: 0,
        }
    }

    fn fresh_value(&mut self, key: &K, now: Instant) -> Option<T> {
        let valid = self.entries.get(key).map(|entry| entry.is_valid_at(now))?;
        if valid {
            self.entries.peek(key).map(|entry| entry.value.clone())
        } else {
            self.entries.pop(key);
            None
        }
    }

    fn evict(&mut self, key: &K) {
        self.entries.pop(key);
        self.pending.remove(key);
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn lock_state<K: Hash + Eq, T: Clone>(
    state: &Mutex<CacheState<K, T>>,
) -> MutexGuard<'_, CacheState<K, T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RequestCache<K: Hash + Eq, T: Clone> {
    state: Arc<Mutex<CacheState<K, T>>>,
    config: CacheConfig,
}

impl<K: Hash + Eq, T: Clone> Clone for RequestCache<K, T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            config: self.config.clone(),
        }
    }
}

impl<K, T> RequestCache<K, T>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_entries).ok_or(ConfigError::MustBePositive {
            field: "max_entries",
        })?;

        Ok(Self {
            state: Arc::new(Mutex::new(CacheState::new(capacity))),
            config,
        })
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_CACHE_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Arc::new(Mutex::new(CacheState::new(capacity))),
            config: CacheConfig::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the cached value for `key` or runs `producer` to get one.
    ///
    /// `producer` is only invoked when there is neither a fresh entry nor a
    /// fetch already running for `key`. With `refresh` the key is evicted
    /// first, so a new fetch always starts.
    #[instrument(skip(self, producer))]
    pub async fn fetch<F, Fut>(
        &self,
        key: K,
        producer: F,
        ttl: Duration,
        refresh: bool,
    ) -> AppResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let fetch = {
            let mut state = lock_state(&self.state);
            if refresh {
                state.evict(&key);
            }

            if let Some(value) = state.fresh_value(&key, Instant::now()) {
                debug!("Cache hit");
                return Ok(value);
            }

            if let Some(pending) = state.pending.get(&key) {
                debug!(generation = pending.generation, "Joining in-flight fetch");
                pending.future.clone()
            } else {
                let generation = state.next_generation;
                state.next_generation = state.next_generation.wrapping_add(1);

                let fetch = Self::settle_on_completion(
                    Arc::downgrade(&self.state),
                    key.clone(),
                    generation,
                    ttl,
                    producer,
                )
                .boxed()
                .shared();

                state.pending.insert(
                    key,
                    PendingFetch {
                        generation,
                        future: fetch.clone(),
                    },
                );
                fetch
            }
        };

        fetch.await
    }

    /// [`fetch`](Self::fetch) with the configured default TTL.
    pub async fn fetch_default<F, Fut>(&self, key: K, producer: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let ttl = self.config.default_ttl();
        self.fetch(key, producer, ttl, false).await
    }

    async fn settle_on_completion<F, Fut>(
        state: Weak<Mutex<CacheState<K, T>>>,
        key: K,
        generation: u64,
        ttl: Duration,
        producer: F,
    ) -> AppResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let result = match AssertUnwindSafe(async move { producer().await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let detail = panic_detail(payload.as_ref());
                error!(?key, generation, %detail, "Producer panicked");
                Err(AppError::new(ErrorKind::Internal, "Fetch failed unexpectedly")
                    .with_internal(detail))
            }
        };

        let Some(state) = state.upgrade() else {
            return result;
        };
        let mut state = lock_state(&state);

        let current = state
            .pending
            .get(&key)
            .is_some_and(|pending| pending.generation == generation);
        if !current {
            debug!(?key, generation, "Fetch superseded, result not stored");
            return result;
        }
        state.pending.remove(&key);

        if let Ok(value) = &result {
            info!(
                ?key,
                ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
                "Cached fetch result"
            );
            state.entries.put(
                key.clone(),
                CacheEntry {
                    key,
                    value: value.clone(),
                    fetched_at: Instant::now(),
                    ttl,
                },
            );
        }

        result
    }

    /// Fresh value for `key`, if any. Never fetches.
    pub fn peek(&self, key: &K) -> Option<T> {
        lock_state(&self.state).fresh_value(key, Instant::now())
    }

    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        lock_state(&self.state).pending.contains_key(key)
    }

    /// Removes the entry for `key` and forgets its in-flight fetch.
    pub fn invalidate(&self, key: &K) {
        debug!(?key, "Invalidating cache key");
        lock_state(&self.state).evict(key);
    }

    pub fn clear(&self) {
        let mut state = lock_state(&self.state);
        state.entries.clear();
        state.pending.clear();
    }

    /// Stored entries, including expired ones not yet read.
    #[must_use]
    pub fn len(&self) -> usize {
        lock_state(&self.state).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Independent [`RequestCache`]s per group, e.g. one per member id.
pub struct KeyedRequestCache<G, K: Hash + Eq, T: Clone> {
    groups: Mutex<HashMap<G, RequestCache<K, T>>>,
    config: CacheConfig,
}

impl<G, K, T> KeyedRequestCache<G, K, T>
where
    G: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            groups: Mutex::new(HashMap::new()),
            config,
        })
    }

    fn lock_groups(&self) -> MutexGuard<'_, HashMap<G, RequestCache<K, T>>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cache for `group`, created on first use.
    pub fn group(&self, group: &G) -> RequestCache<K, T> {
        let mut groups = self.lock_groups();
        if let Some(cache) = groups.get(group) {
            return cache.clone();
        }
        let capacity = NonZeroUsize::new(self.config.max_entries).unwrap_or(NonZeroUsize::MIN);
        let cache = RequestCache {
            state: Arc::new(Mutex::new(CacheState::new(capacity))),
            config: self.config.clone(),
        };
        groups.insert(group.clone(), cache.clone());
        cache
    }

    pub async fn fetch<F, Fut>(
        &self,
        group: &G,
        key: K,
        producer: F,
        ttl: Duration,
        refresh: bool,
    ) -> AppResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let cache = self.group(group);
        cache.fetch(key, producer, ttl, refresh).await
    }

    pub fn invalidate(&self, group: &G, key: &K) {
        if let Some(cache) = self.lock_groups().get(group) {
            cache.invalidate(key);
        }
    }

    pub fn invalidate_group(&self, group: &G) {
        if let Some(cache) = self.lock_groups().remove(group) {
            cache.clear();
        }
    }

    pub fn clear_all(&self) {
        let mut groups = self.lock_groups();
        for cache in groups.values() {
            cache.clear();
        }
        groups.clear();
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.lock_groups().len()
    }
}
