//! Write-through cached map for maps with a single userspace writer
//!
//! When this process is the only writer of a map, every value the kernel
//! holds is one we wrote (or one that was there when we opened it). The
//! wrapper drains the map once at open, mirrors each successful write, and
//! answers `get_value`/`contains_key` from memory.
//!
//! Nothing can detect another writer: a second writer silently breaks the
//! cache. The map is opened exclusively to rule out a second writer in this
//! process.
//!
//! Iteration (`get_first_key`, `get_next_key`, `for_each`) goes to the
//! kernel without taking the cache lock, so it can briefly disagree with
//! `get_value` while a write from this instance is in flight.

use crate::{
    codec::FixedLayout,
    error::Result,
    kernel::AccessMode,
    map::{BpfMap, MapEntry, MapStore},
    registry::MapRegistry,
};
use log::info;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, hash::Hash, sync::Arc};

/// A [`BpfMap`] whose reads are served from an in-process copy
pub struct SingleWriterBpfMap<K, V> {
    map: BpfMap<K, V>,
    /// Held across the kernel call of every write so cache and map never disagree
    cache: Mutex<HashMap<K, V>>,
}

impl<K, V> SingleWriterBpfMap<K, V>
where
    K: FixedLayout + Eq + Hash,
    V: FixedLayout,
{
    /// The registry's instance for `path`, opened and drained on first use
    pub fn get_or_open(registry: &MapRegistry, path: &str) -> Result<Arc<Self>> {
        registry.singleton(path, || Self::open(registry, path))
    }

    fn open(registry: &MapRegistry, path: &str) -> Result<Self> {
        let map = BpfMap::open(registry, path, AccessMode::ExclusiveReadWrite)?;

        let mut cache = HashMap::new();
        for entry in map.entries() {
            if let MapEntry::Present { key, value } = entry? {
                cache.insert(key, value);
            }
        }
        info!("{}: cached {} entries for single-writer access", path, cache.len());

        Ok(Self {
            map,
            cache: Mutex::new(cache),
        })
    }

    /// Pin path of the underlying map
    pub fn path(&self) -> &str {
        self.map.path()
    }

    /// Number of cached entries
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

impl<K, V> MapStore<K, V> for SingleWriterBpfMap<K, V>
where
    K: FixedLayout + Eq + Hash,
    V: FixedLayout,
{
    fn update_entry(&self, key: &K, value: &V) -> Result<()> {
        let mut cache = self.cache.lock();
        self.map.update_entry(key, value)?;
        cache.insert(*key, *value);
        Ok(())
    }

    fn insert_entry(&self, key: &K, value: &V) -> Result<()> {
        let mut cache = self.cache.lock();
        self.map.insert_entry(key, value)?;
        cache.insert(*key, *value);
        Ok(())
    }

    fn replace_entry(&self, key: &K, value: &V) -> Result<()> {
        let mut cache = self.cache.lock();
        self.map.replace_entry(key, value)?;
        cache.insert(*key, *value);
        Ok(())
    }

    fn insert_or_replace_entry(&self, key: &K, value: &V) -> Result<bool> {
        let mut cache = self.cache.lock();
        let inserted = self.map.insert_or_replace_entry(key, value)?;
        cache.insert(*key, *value);
        Ok(inserted)
    }

    fn delete_entry(&self, key: &K) -> Result<bool> {
        let mut cache = self.cache.lock();
        let removed = self.map.delete_entry(key)?;
        cache.remove(key);
        Ok(removed)
    }

    fn get_value(&self, key: &K) -> Result<Option<V>> {
        Ok(self.cache.lock().get(key).copied())
    }

    fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.cache.lock().contains_key(key))
    }

    fn get_first_key(&self) -> Result<Option<K>> {
        self.map.get_first_key()
    }

    fn get_next_key(&self, key: &K) -> Result<Option<K>> {
        self.map.get_next_key(key)
    }

    fn for_each<F>(&self, visitor: F) -> Result<usize>
    where
        F: FnMut(&K, &V) -> Result<()>,
    {
        self.map.for_each(visitor)
    }

    fn clear(&self) -> Result<()> {
        while let Some(key) = self.get_first_key()? {
            self.delete_entry(&key)?;
        }
        Ok(())
    }
}

impl<K, V> fmt::Debug for SingleWriterBpfMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleWriterBpfMap")
            .field("map", &self.map)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}
