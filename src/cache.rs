//! Response caching with TTL and a FIFO capacity bound
//!
//! Entries are valid while `now - written_at < ttl`. When the cache is full,
//! inserting a new key evicts the entry that was inserted first; reads never
//! change eviction order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};

/// Default TTL for sheet data entries
pub const SHEET_TTL: Duration = Duration::from_secs(300);
/// Default TTL for the sheet list entry; tab titles change less often than cells
pub const LIST_TTL: Duration = Duration::from_secs(600);
/// Maximum number of cached entries
pub const MAX_CACHE_SIZE: usize = 100;
/// Interval of the background expiry sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Cache key for the sheet list
pub const LIST_KEY: &str = "list";

/// Cache key for one sheet's values
#[must_use]
pub fn sheet_key(sheet: &str) -> String {
    format!("sheet:{sheet}")
}

/// Thread-safe TTL cache with insertion-order eviction
pub struct TtlCache<V> {
    inner: Mutex<Inner<V>>,
    default_ttl: Duration,
    max_size: usize,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

struct Inner<V> {
    entries: HashMap<String, CachedEntry<V>>,
    /// Insertion sequence -> key, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

struct CachedEntry<V> {
    value: V,
    written_at: u64,
    ttl_ms: u64,
    seq: u64,
}

impl<V> CachedEntry<V> {
    fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.written_at) >= self.ttl_ms
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStats {
    /// Calculate hit rate as a fraction (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache using the system clock
    #[must_use]
    pub fn new(default_ttl: Duration, max_size: usize) -> Self {
        Self::with_clock(default_ttl, max_size, Arc::new(SystemClock))
    }

    /// Create a cache reading time from `clock`
    #[must_use]
    pub fn with_clock(default_ttl: Duration, max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            default_ttl,
            max_size: max_size.max(1),
            clock,
            stats: CacheStats::default(),
        }
    }

    /// Get a cached value if present and not expired
    ///
    /// An expired entry is removed on the spot and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        let expired_seq = match inner.entries.get(key) {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) if !entry.is_expired(now) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(entry) => entry.seq,
        };

        inner.entries.remove(key);
        inner.order.remove(&expired_seq);
        self.stats.expirations.fetch_add(1, Ordering::Relaxed);
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value with the default TTL
    pub fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Store a value with an explicit TTL
    ///
    /// Overwriting an existing key refreshes its timestamp but keeps its
    /// place in the eviction order.
    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let now = self.clock.now_ms();
        let ttl_ms = duration_ms(ttl);
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.value = value;
            entry.written_at = now;
            entry.ttl_ms = ttl_ms;
            return;
        }

        if inner.entries.len() >= self.max_size {
            if let Some((_, oldest)) = inner.order.pop_first() {
                inner.entries.remove(&oldest);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %oldest, "Evicted oldest cache entry");
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.to_string());
        inner.entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                written_at: now,
                ttl_ms,
                seq,
            },
        );
    }

    /// Remove every expired entry, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        let expired: Vec<(String, u64)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.seq))
            .collect();

        for (key, seq) in &expired {
            inner.entries.remove(key);
            inner.order.remove(seq);
        }

        let count = expired.len();
        if count > 0 {
            self.stats
                .expirations
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Remove a single entry
    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.order.remove(&entry.seq);
                true
            }
            None => false,
        }
    }

    /// Clear all cached entries
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Number of entries currently held, expired or not
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            size: self.len(),
            max_size: self.max_size,
            hit_rate: self.stats.hit_rate(),
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses (absent or expired)
    pub misses: u64,
    /// Entries evicted to respect the capacity bound
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Current number of entries
    pub size: usize,
    /// Capacity bound
    pub max_size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}
