use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::CacheDomain;

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub stored_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.stored_at)
    }

    /// An entry is served up to and including the instant `stored_at + ttl`.
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

struct Entries<T> {
    map: HashMap<String, CacheEntry<T>>,
    /// Bumped by every `invalidate_all`
    generation: u64,
}

/// Keyed cache with a fixed time-to-live, one instance per data domain.
///
/// Stale entries are evicted lazily when a lookup finds them. All methods take
/// `&self` and hold the lock only for the map operation, so any interleaving
/// of `get`/`put`/`invalidate_all` across await points is safe.
pub struct TtlCache<T> {
    domain: String,
    ttl: Duration,
    entries: Mutex<Entries<T>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(domain: impl Into<String>, ttl: Duration) -> Self {
        Self {
            domain: domain.into(),
            ttl,
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                generation: 0,
            }),
        }
    }

    pub fn for_domain(domain: CacheDomain, ttl: Duration) -> Self {
        Self::new(domain.name(), ttl)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut guard = self.lock();
        let entries = &mut guard.map;
        match entries.get(key) {
            Some(entry) if !entry.is_stale(self.ttl) => {
                debug!(domain = %self.domain, key = key, "Cache hit");
                Some(entry.value.clone())
            }
            Some(_) => {
                debug!(domain = %self.domain, key = key, "Cache entry stale, evicting");
                entries.remove(key);
                None
            }
            None => {
                debug!(domain = %self.domain, key = key, "Cache miss");
                None
            }
        }
    }

    pub fn put(&self, key: impl Into<String>, value: T) {
        self.lock().map.insert(key.into(), CacheEntry::new(value));
    }

    /// Current invalidation generation; capture it before starting a fetch.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Store `value` only if no invalidation happened since `generation` was read.
    ///
    /// A read that was in flight while a write invalidated the domain carries
    /// pre-write data and is dropped here.
    pub fn put_if_current(&self, generation: u64, key: impl Into<String>, value: T) -> bool {
        let mut entries = self.lock();
        if entries.generation != generation {
            debug!(domain = %self.domain, "Dropping result fetched before invalidation");
            return false;
        }
        entries.map.insert(key.into(), CacheEntry::new(value));
        true
    }

    /// Drop every entry. Writes call this since keys carry no dependency information.
    pub fn invalidate_all(&self) {
        let mut entries = self.lock();
        if !entries.map.is_empty() {
            debug!(domain = %self.domain, evicted = entries.map.len(), "Cache invalidated");
        }
        entries.map.clear();
        entries.generation += 1;
    }

    /// Number of stored entries, stale ones included until looked up
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries<T>> {
        // A panic mid-insert cannot leave the map inconsistent
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
