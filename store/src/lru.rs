//! Bounded LRU cache whose entries expire
//!
//! Expiry is lazy: an entry older than the TTL is dropped when a read
//! finds it, never by a background sweep. Capacity pressure evicts the
//! least recently read or written entry.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    hash::Hash,
    time::{Duration, Instant},
};

/// Millisecond time source
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin
    fn now_millis(&self) -> u64;
}

/// Monotonic clock counting from its creation
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

type Predicate<V> = Box<dyn Fn(&V) -> bool + Send + Sync>;

struct Entry<V> {
    value: V,
    inserted_at: u64,
    /// Position in `Inner::recency`
    tick: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// tick -> key, oldest first
    recency: BTreeMap<u64, K>,
    next_tick: u64,
}

impl<K: Hash + Eq + Clone, V: Clone> Inner<K, V> {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn get(&mut self, key: &K, now: u64, ttl: u64) -> Option<V> {
        let expired = now > self.entries.get(key)?.inserted_at.saturating_add(ttl);
        if expired {
            self.remove(key);
            return None;
        }

        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.clone());
        Some(entry.value.clone())
    }

    fn put(&mut self, key: K, value: V, now: u64, capacity: usize) {
        let tick = self.bump();
        let entry = Entry {
            value,
            inserted_at: now,
            tick,
        };
        if let Some(old) = self.entries.insert(key.clone(), entry) {
            self.recency.remove(&old.tick);
        }
        self.recency.insert(tick, key);

        while self.entries.len() > capacity {
            match self.recency.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry.value)
    }
}

/// Thread-safe LRU cache with per-entry time to live
pub struct LruCacheWithExpiry<K, V> {
    capacity: usize,
    ttl_millis: u64,
    clock: Box<dyn Clock>,
    should_cache: Predicate<V>,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCacheWithExpiry<K, V> {
    /// Create a new cache on the monotonic clock, caching every value
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of entries
    /// * `ttl` - How long an entry stays readable after it is written
    ///
    /// # Returns
    ///
    /// The cache, or `InvalidArgument` if `capacity` is zero
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("cache capacity must be at least 1".into()));
        }
        Ok(Self {
            capacity,
            ttl_millis: ttl.as_millis() as u64,
            clock: Box::new(MonotonicClock::default()),
            should_cache: Box::new(|_| true),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
            }),
        })
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Only values passing `predicate` are stored by [`get_or_compute`](Self::get_or_compute)
    pub fn with_should_cache<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&V) -> bool + Send + Sync + 'static,
    {
        self.should_cache = Box::new(predicate);
        self
    }

    /// Live value for `key`; an expired entry is evicted
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_millis();
        self.inner.lock().get(key, now, self.ttl_millis)
    }

    /// Cached value, or `supplier`'s result
    ///
    /// `supplier` runs under the cache lock, so it must not touch this cache.
    /// `None` from the supplier is returned without caching, as is any value
    /// the should-cache predicate rejects.
    pub fn get_or_compute<F>(&self, key: K, supplier: F) -> Option<V>
    where
        F: FnOnce() -> Option<V>,
    {
        let mut inner = self.inner.lock();
        let now = self.clock.now_millis();
        if let Some(value) = inner.get(&key, now, self.ttl_millis) {
            return Some(value);
        }

        let value = supplier()?;
        if (self.should_cache)(&value) {
            inner.put(key, value.clone(), self.clock.now_millis(), self.capacity);
        }
        Some(value)
    }

    /// Store `value`, evicting the least recently used entry when full
    pub fn put(&self, key: K, value: V) {
        let now = self.clock.now_millis();
        self.inner.lock().put(key, value, now, self.capacity);
    }

    /// Store `value` unless a live entry exists; returns that entry's value
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        let mut inner = self.inner.lock();
        let now = self.clock.now_millis();
        if let Some(existing) = inner.get(&key, now, self.ttl_millis) {
            return Some(existing);
        }
        inner.put(key, value, now, self.capacity);
        None
    }

    /// Drop `key`, returning its value even if expired
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Number of stored entries, expired ones included until they are read
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no entries are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> fmt::Debug for LruCacheWithExpiry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCacheWithExpiry")
            .field("capacity", &self.capacity)
            .field("ttl_millis", &self.ttl_millis)
            .field("len", &self.inner.lock().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Clone, Default)]
    struct ManualClock(Arc<AtomicU64>);

    impl ManualClock {
        fn set(&self, millis: u64) {
            self.0.store(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn cache(capacity: usize, ttl_millis: u64) -> (ManualClock, LruCacheWithExpiry<&'static str, i32>) {
        let clock = ManualClock::default();
        let cache = LruCacheWithExpiry::new(capacity, Duration::from_millis(ttl_millis))
            .unwrap()
            .with_clock(clock.clone());
        (clock, cache)
    }

    #[test]
    fn third_insert_evicts_the_oldest() {
        let (_clock, cache) = cache(2, 60_000);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reads_refresh_recency() {
        let (_clock, cache) = cache(2, 60_000);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.put("c", 3);

        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (clock, cache) = cache(4, 1_000);
        clock.set(5_000);
        cache.put("a", 1);
        cache.put("b", 2);

        clock.set(5_999);
        assert_eq!(cache.get(&"a"), Some(1));
        clock.set(6_000);
        assert_eq!(cache.get(&"a"), Some(1));

        clock.set(6_001);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), None);
        // Only the entry that was read is gone
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn get_or_compute_caches_supplied_values() {
        let (_clock, cache) = cache(4, 60_000);
        let calls = AtomicUsize::new(0);
        let supplier = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Some(7)
        };

        assert_eq!(cache.get_or_compute("k", supplier), Some(7));
        assert_eq!(cache.get_or_compute("k", supplier), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_or_compute_skips_none_and_rejected_values() {
        let (_clock, cache) = cache(4, 60_000);
        let cache = cache.with_should_cache(|v| *v >= 0);

        assert_eq!(cache.get_or_compute("none", || None), None);
        assert_eq!(cache.get_or_compute("neg", || Some(-1)), Some(-1));
        assert!(cache.is_empty());

        assert_eq!(cache.get_or_compute("pos", || Some(1)), Some(1));
        assert_eq!(cache.get(&"pos"), Some(1));
    }

    #[test]
    fn get_or_compute_recomputes_expired_entries() {
        let (clock, cache) = cache(4, 100);
        cache.put("k", 1);
        clock.set(101);
        assert_eq!(cache.get_or_compute("k", || Some(2)), Some(2));
        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[test]
    fn put_if_absent_keeps_live_values() {
        let (clock, cache) = cache(4, 100);
        assert_eq!(cache.put_if_absent("k", 1), None);
        assert_eq!(cache.put_if_absent("k", 2), Some(1));
        assert_eq!(cache.get(&"k"), Some(1));

        clock.set(500);
        assert_eq!(cache.put_if_absent("k", 3), None);
        assert_eq!(cache.get(&"k"), Some(3));
    }

    #[test]
    fn remove_and_clear() {
        let (_clock, cache) = cache(4, 60_000);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.remove(&"a"), None);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            LruCacheWithExpiry::<u32, u32>::new(0, Duration::from_secs(1)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn concurrent_use_stays_within_capacity() {
        let cache: LruCacheWithExpiry<u32, u32> =
            LruCacheWithExpiry::new(16, Duration::from_secs(60)).unwrap();

        std::thread::scope(|s| {
            for t in 0..4u32 {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..1_000u32 {
                        let key = (t * 1_000 + i) % 64;
                        cache.get_or_compute(key, || Some(key * 2));
                        if let Some(v) = cache.get(&key) {
                            assert_eq!(v, key * 2);
                        }
                    }
                });
            }
        });

        assert!(cache.len() <= 16);
    }
}
