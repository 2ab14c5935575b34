//! Memoized prompt formatting
//!
//! Rendering a Jinja chat template is much slower than a hash lookup, and
//! benchmark traffic repeats the same instructions. [`PromptFormatter`]
//! caches the rendered prompt keyed by the exact raw message text in a
//! bounded [`LruCache`].

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use serde::{Deserialize, Serialize};

use crate::{chat_template::ChatTemplateEngine, error::Result};

/// Default number of cached prompts
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Bounded least-recently-used map
///
/// Recency is a monotonically increasing tick; the tick index gives the
/// eviction order in O(log n).
#[derive(Debug)]
pub struct LruCache<K, V> {
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
    capacity: usize,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up an entry and mark it most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        let (_, used) = self.entries.get_mut(key)?;
        let previous = std::mem::replace(used, tick);
        if let Some(k) = self.recency.remove(&previous) {
            self.recency.insert(tick, k);
        }
        self.entries.get(key).map(|(value, _)| value)
    }

    /// Insert or replace an entry, returning the evicted one if any
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let tick = self.next_tick();
        if let Some((_, used)) = self.entries.insert(key.clone(), (value, tick)) {
            self.recency.remove(&used);
            self.recency.insert(tick, key);
            return None;
        }
        self.recency.insert(tick, key);

        if self.entries.len() <= self.capacity {
            return None;
        }
        let (_, oldest) = self.recency.pop_first()?;
        self.entries
            .remove(&oldest)
            .map(|(value, _)| (oldest, value))
    }

    /// Whether `key` is cached (does not touch recency)
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that rendered the template
    pub misses: u64,
    /// Entries currently cached
    pub entries: usize,
    /// Maximum entries
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups served from cache
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Chat template wrapped in a bounded memoization cache
pub struct PromptFormatter {
    template: Box<dyn ChatTemplateEngine>,
    cache: Mutex<LruCache<String, Arc<str>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for PromptFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptFormatter")
            .field("format", &self.template.format())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl PromptFormatter {
    /// Create a formatter caching up to `capacity` prompts
    #[must_use]
    pub fn new(template: Box<dyn ChatTemplateEngine>, capacity: usize) -> Self {
        Self {
            template,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Templated prompt for a raw user message
    ///
    /// Identical input returns the cached value without rendering. The lock
    /// is not held while rendering, so two threads racing on the same new
    /// message may both render; both results are identical.
    ///
    /// # Errors
    ///
    /// Returns `TemplateError` if rendering fails; failures are not cached
    pub fn format(&self, message: &str) -> Result<Arc<str>> {
        let key = message.to_string();
        if let Some(hit) = self.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(hit));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let rendered: Arc<str> = Arc::from(self.template.format_user(message)?);
        if self.lock().insert(key, Arc::clone(&rendered)).is_some() {
            tracing::trace!("Prompt cache evicted an entry");
        }
        Ok(rendered)
    }

    /// Format every message, preserving order
    ///
    /// # Errors
    ///
    /// The first template failure
    pub fn format_all(&self, messages: &[String]) -> Result<Vec<String>> {
        messages
            .iter()
            .map(|m| self.format(m).map(|p| p.to_string()))
            .collect()
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let cache = self.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: cache.len(),
            capacity: cache.capacity(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<str>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
