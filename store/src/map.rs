//! Typed BPF map store
//!
//! `BpfMap<K, V>` turns a byte-level kernel handle into typed CRUD and
//! iteration. Keys and values are encoded before every kernel call and
//! decoded right after every kernel read.

use crate::{
    codec::{FixedLayout, LayoutCheck},
    error::{Error, Result},
    kernel::{AccessMode, KernelMap, UpdateFlag},
    registry::MapRegistry,
};
use log::{debug, warn};
use std::{fmt, marker::PhantomData, sync::Arc};

/// Map-like access to a kernel map
///
/// Implemented by [`BpfMap`] and by the caching
/// [`SingleWriterBpfMap`](crate::single_writer::SingleWriterBpfMap), so callers
/// can be written against either.
pub trait MapStore<K: FixedLayout, V: FixedLayout> {
    /// Insert or replace
    fn update_entry(&self, key: &K, value: &V) -> Result<()>;

    /// Insert; `AlreadyExists` if the key is present
    fn insert_entry(&self, key: &K, value: &V) -> Result<()>;

    /// Replace; `NotFound` if the key is absent
    fn replace_entry(&self, key: &K, value: &V) -> Result<()>;

    /// Insert if absent, otherwise replace. Returns true if inserted.
    fn insert_or_replace_entry(&self, key: &K, value: &V) -> Result<bool>;

    /// Returns true if a row was removed
    fn delete_entry(&self, key: &K) -> Result<bool>;

    /// Value stored under `key`; `None` when absent
    fn get_value(&self, key: &K) -> Result<Option<V>>;

    /// Whether `key` is present
    fn contains_key(&self, key: &K) -> Result<bool>;

    /// First key in kernel order; `None` on an empty map
    fn get_first_key(&self) -> Result<Option<K>>;

    /// Key after `key` in kernel order; the first key if `key` is absent
    fn get_next_key(&self, key: &K) -> Result<Option<K>>;

    /// Whether the map has no entries
    fn is_empty(&self) -> Result<bool> {
        Ok(self.get_first_key()?.is_none())
    }

    /// Visit every entry
    ///
    /// The visitor may delete the key it is given and nothing else.
    /// Returns the number of rows that disappeared before they could be read.
    fn for_each<F>(&self, visitor: F) -> Result<usize>
    where
        F: FnMut(&K, &V) -> Result<()>;

    /// Delete every entry
    fn clear(&self) -> Result<()>;
}

/// One step of an iteration over a map
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEntry<K, V> {
    Present { key: K, value: V },
    /// The key was listed but deleted by another writer before its value was read
    Vanished { key: K },
}

/// A typed view over a shared kernel map handle
pub struct BpfMap<K, V> {
    handle: Arc<dyn KernelMap>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K: FixedLayout, V: FixedLayout> BpfMap<K, V> {
    /// Open (or reuse) the handle for `path` in `mode`
    ///
    /// # Arguments
    ///
    /// * `registry` - Registry owning the shared handle
    /// * `path` - Pin path in bpffs
    /// * `mode` - Access mode; sizes come from `K` and `V`
    pub fn open(registry: &MapRegistry, path: &str, mode: AccessMode) -> Result<Self> {
        #[allow(clippy::let_unit_value)]
        let () = LayoutCheck::<K, V>::VALID;
        let handle = registry.obtain(path, mode, K::SIZE as u32, V::SIZE as u32)?;
        Self::from_handle(handle)
    }

    /// Wrap an already open handle whose geometry matches `K` and `V`
    pub fn from_handle(handle: Arc<dyn KernelMap>) -> Result<Self> {
        if handle.key_size() != K::SIZE {
            return Err(Error::Codec {
                expected: K::SIZE,
                actual: handle.key_size(),
            });
        }
        if handle.value_size() != V::SIZE {
            return Err(Error::Codec {
                expected: V::SIZE,
                actual: handle.value_size(),
            });
        }
        Ok(Self {
            handle,
            _types: PhantomData,
        })
    }

    /// Pin path of the underlying map
    pub fn path(&self) -> &str {
        self.handle.path()
    }

    /// Iterate over the map
    ///
    /// Each step reads the value and the following key before yielding, so
    /// the caller may delete the yielded key without derailing iteration.
    pub fn entries(&self) -> Entries<'_, K, V> {
        Entries {
            map: self,
            cursor: Cursor::Start,
        }
    }

    fn decode_key(bytes: Option<Vec<u8>>) -> Result<Option<K>> {
        bytes.map(|b| K::decode(&b)).transpose()
    }
}

impl<K: FixedLayout, V: FixedLayout> MapStore<K, V> for BpfMap<K, V> {
    fn update_entry(&self, key: &K, value: &V) -> Result<()> {
        self.handle
            .update(&key.encode(), &value.encode(), UpdateFlag::Any)
    }

    fn insert_entry(&self, key: &K, value: &V) -> Result<()> {
        self.handle
            .update(&key.encode(), &value.encode(), UpdateFlag::NoExist)
    }

    fn replace_entry(&self, key: &K, value: &V) -> Result<()> {
        self.handle
            .update(&key.encode(), &value.encode(), UpdateFlag::Exist)
    }

    fn insert_or_replace_entry(&self, key: &K, value: &V) -> Result<bool> {
        match self.insert_entry(key, value) {
            Ok(()) => return Ok(true),
            Err(Error::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
        match self.replace_entry(key, value) {
            Ok(()) => Ok(false),
            // Deleted between the two attempts. Delete only takes a key, so
            // this is indistinguishable from the replace landing first.
            Err(Error::NotFound) => {
                debug!("{}: replace raced a delete, treating as replaced", self.path());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn delete_entry(&self, key: &K) -> Result<bool> {
        self.handle.delete(&key.encode())
    }

    fn get_value(&self, key: &K) -> Result<Option<V>> {
        self.handle
            .lookup(&key.encode())?
            .map(|b| V::decode(&b))
            .transpose()
    }

    fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.handle.lookup(&key.encode())?.is_some())
    }

    fn get_first_key(&self) -> Result<Option<K>> {
        Self::decode_key(self.handle.next_key(None)?)
    }

    fn get_next_key(&self, key: &K) -> Result<Option<K>> {
        Self::decode_key(self.handle.next_key(Some(&key.encode()))?)
    }

    fn for_each<F>(&self, mut visitor: F) -> Result<usize>
    where
        F: FnMut(&K, &V) -> Result<()>,
    {
        let mut vanished = 0;
        for entry in self.entries() {
            match entry? {
                MapEntry::Present { key, value } => visitor(&key, &value)?,
                MapEntry::Vanished { .. } => {
                    vanished += 1;
                    warn!("{}: entry deleted during iteration, skipped", self.path());
                }
            }
        }
        Ok(vanished)
    }

    fn clear(&self) -> Result<()> {
        while let Some(key) = self.get_first_key()? {
            // false means a concurrent deleter got there first
            self.delete_entry(&key)?;
        }
        Ok(())
    }
}

impl<K, V> fmt::Debug for BpfMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BpfMap")
            .field("path", &self.handle.path())
            .field("key_size", &self.handle.key_size())
            .field("value_size", &self.handle.value_size())
            .finish()
    }
}

enum Cursor<K> {
    Start,
    At(K),
    Done,
}

/// Iterator returned by [`BpfMap::entries`]
pub struct Entries<'a, K, V> {
    map: &'a BpfMap<K, V>,
    cursor: Cursor<K>,
}

impl<K: FixedLayout, V: FixedLayout> Entries<'_, K, V> {
    fn advance(&mut self) -> Result<Option<MapEntry<K, V>>> {
        let key = match std::mem::replace(&mut self.cursor, Cursor::Done) {
            Cursor::Start => match self.map.get_first_key()? {
                Some(key) => key,
                None => return Ok(None),
            },
            Cursor::At(key) => key,
            Cursor::Done => return Ok(None),
        };

        let value = self.map.get_value(&key)?;
        if let Some(next) = self.map.get_next_key(&key)? {
            self.cursor = Cursor::At(next);
        }

        Ok(Some(match value {
            Some(value) => MapEntry::Present { key, value },
            None => MapEntry::Vanished { key },
        }))
    }
}

impl<K: FixedLayout, V: FixedLayout> Iterator for Entries<'_, K, V> {
    type Item = Result<MapEntry<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        // Cursor is Done after an error, ending the iteration
        self.advance().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMapFs;
    use map_common::{CookieTagValue, StatsKey, StatsValue};

    const PATH: &str = "/sys/fs/bpf/test/map_u32";
    const STATS_PATH: &str = "/sys/fs/bpf/test/map_stats";

    fn open_u32(max_entries: u32) -> (MemoryMapFs, MapRegistry, BpfMap<u32, u32>) {
        let fs = MemoryMapFs::new();
        fs.create(PATH, 4, 4, max_entries).unwrap();
        let registry = MapRegistry::new(fs.clone());
        let map = BpfMap::open(&registry, PATH, AccessMode::ReadWrite).unwrap();
        (fs, registry, map)
    }

    fn keys(map: &BpfMap<u32, u32>) -> Vec<u32> {
        let mut keys = Vec::new();
        map.for_each(|k, _| {
            keys.push(*k);
            Ok(())
        })
        .unwrap();
        keys
    }

    #[test]
    fn insert_replace_delete_scenario() {
        let (_fs, _registry, map) = open_u32(16);

        map.insert_entry(&1, &100).unwrap();
        assert!(matches!(map.insert_entry(&1, &200), Err(Error::AlreadyExists)));
        map.replace_entry(&1, &200).unwrap();
        assert_eq!(map.get_value(&1).unwrap(), Some(200));

        assert!(map.delete_entry(&1).unwrap());
        assert!(!map.delete_entry(&1).unwrap());
        assert_eq!(map.get_first_key().unwrap(), None);
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn replace_of_absent_key_is_not_found() {
        let (_fs, _registry, map) = open_u32(16);
        assert!(matches!(map.replace_entry(&9, &1), Err(Error::NotFound)));
        assert_eq!(map.get_value(&9).unwrap(), None);
        assert!(!map.contains_key(&9).unwrap());
    }

    #[test]
    fn update_is_idempotent() {
        let (fs, _registry, map) = open_u32(16);
        map.update_entry(&3, &30).unwrap();
        map.update_entry(&3, &30).unwrap();
        assert_eq!(map.get_value(&3).unwrap(), Some(30));
        assert_eq!(fs.entry_count(PATH), Some(1));
    }

    #[test]
    fn insert_or_replace_reports_which_happened() {
        let (_fs, _registry, map) = open_u32(16);
        assert!(map.insert_or_replace_entry(&5, &1).unwrap());
        assert!(!map.insert_or_replace_entry(&5, &2).unwrap());
        assert_eq!(map.get_value(&5).unwrap(), Some(2));
    }

    #[test]
    fn insert_or_replace_races_deletes_without_errors() {
        let (_fs, _registry, map) = open_u32(16);

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..2_000u32 {
                    map.insert_or_replace_entry(&7, &i).unwrap();
                    // Only this thread writes, so the row is its last write or gone
                    let value = map.get_value(&7).unwrap();
                    assert!(value.is_none() || value == Some(i));
                }
            });
            s.spawn(|| {
                for _ in 0..2_000 {
                    map.delete_entry(&7).unwrap();
                }
            });
        });

        assert_eq!(map.contains_key(&7).unwrap(), map.get_value(&7).unwrap().is_some());
    }

    #[test]
    fn for_each_totals_stats_rows() {
        let fs = MemoryMapFs::new();
        fs.create(STATS_PATH, 16, 32, 8).unwrap();
        let registry = MapRegistry::new(fs);
        let map: BpfMap<StatsKey, StatsValue> =
            BpfMap::open(&registry, STATS_PATH, AccessMode::ReadWrite).unwrap();

        for iface_index in 1..=3u32 {
            let key = StatsKey {
                uid: 10_001,
                tag: 0,
                counter_set: 0,
                iface_index,
            };
            let value = StatsValue {
                rx_packets: 1,
                rx_bytes: 100 * iface_index as u64,
                tx_packets: 2,
                tx_bytes: u64::MAX,
            };
            map.insert_entry(&key, &value).unwrap();
        }

        let mut total = StatsValue::default();
        let vanished = map
            .for_each(|_, value| {
                total.accumulate(value);
                Ok(())
            })
            .unwrap();

        assert_eq!(vanished, 0);
        assert_eq!(total.rx_packets, 3);
        assert_eq!(total.rx_bytes, 600);
        assert_eq!(total.tx_packets, 6);
        // Byte counters wrap like the kernel side
        assert_eq!(total.tx_bytes, u64::MAX - 2);
    }

    #[test]
    fn cookie_tags_use_the_catalogued_geometry() {
        let geometry = map_common::known_map(map_common::COOKIE_TAG_MAP_PATH).unwrap();
        let fs = MemoryMapFs::new();
        fs.create(geometry.path, geometry.key_size, geometry.value_size, 8)
            .unwrap();
        let registry = MapRegistry::new(fs);
        let tags: BpfMap<u64, CookieTagValue> =
            BpfMap::open(&registry, geometry.path, AccessMode::ReadWrite).unwrap();

        let cookie = 0x0000_1234_5678_9abc_u64;
        let tag = CookieTagValue {
            uid: 10_042,
            tag: 0xffff_0001,
        };
        tags.insert_entry(&cookie, &tag).unwrap();
        assert_eq!(tags.get_value(&cookie).unwrap(), Some(tag));
        assert!(tags.delete_entry(&cookie).unwrap());
    }

    #[test]
    fn next_key_of_absent_key_is_first_key() {
        let (_fs, _registry, map) = open_u32(16);
        for k in [10u32, 20, 30] {
            map.insert_entry(&k, &k).unwrap();
        }
        let first = map.get_first_key().unwrap().unwrap();
        assert_eq!(map.get_next_key(&12_345).unwrap(), Some(first));
    }

    #[test]
    fn for_each_visits_every_entry() {
        let (_fs, _registry, map) = open_u32(16);
        for k in 0..5u32 {
            map.insert_entry(&k, &(k * 10)).unwrap();
        }

        let mut seen = Vec::new();
        let vanished = map
            .for_each(|k, v| {
                seen.push((*k, *v));
                Ok(())
            })
            .unwrap();

        seen.sort();
        assert_eq!(seen, (0..5).map(|k| (k, k * 10)).collect::<Vec<_>>());
        assert_eq!(vanished, 0);
    }

    #[test]
    fn for_each_allows_deleting_the_current_key() {
        let (_fs, _registry, map) = open_u32(16);
        for k in 0..6u32 {
            map.insert_entry(&k, &k).unwrap();
        }

        let mut visited = 0;
        map.for_each(|k, v| {
            visited += 1;
            if v % 2 == 0 {
                map.delete_entry(k)?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(visited, 6);
        assert_eq!(keys(&map), vec![1, 3, 5]);
    }

    #[test]
    fn rows_deleted_mid_iteration_are_reported_as_vanished() {
        let (_fs, _registry, map) = open_u32(16);
        map.insert_entry(&1, &10).unwrap();
        map.insert_entry(&2, &20).unwrap();

        let mut entries = map.entries();
        let first = entries.next().unwrap().unwrap();
        let next_key = match first {
            MapEntry::Present { key, .. } => map.get_next_key(&key).unwrap().unwrap(),
            MapEntry::Vanished { .. } => panic!("first row cannot vanish"),
        };

        // Another writer empties the map after the cursor moved on
        map.clear().unwrap();

        assert_eq!(
            entries.next().unwrap().unwrap(),
            MapEntry::Vanished { key: next_key }
        );
        assert!(entries.next().is_none());
    }

    #[test]
    fn visitor_errors_stop_iteration() {
        let (_fs, _registry, map) = open_u32(16);
        for k in 0..3u32 {
            map.insert_entry(&k, &k).unwrap();
        }
        let mut calls = 0;
        let err = map
            .for_each(|_, _| {
                calls += 1;
                Err(Error::InvalidArgument("stop".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn clear_empties_the_map() {
        let (fs, _registry, map) = open_u32(64);
        for k in 0..50u32 {
            map.insert_entry(&k, &k).unwrap();
        }
        map.clear().unwrap();
        assert!(map.is_empty().unwrap());
        assert_eq!(fs.entry_count(PATH), Some(0));
    }

    #[test]
    fn struct_keys_and_values() {
        let fs = MemoryMapFs::new();
        fs.create(STATS_PATH, 16, 32, 8).unwrap();
        let registry = MapRegistry::new(fs);
        let map: BpfMap<StatsKey, StatsValue> =
            BpfMap::open(&registry, STATS_PATH, AccessMode::ReadWrite).unwrap();

        let key = StatsKey {
            uid: 10_001,
            tag: 0,
            counter_set: 0,
            iface_index: 3,
        };
        let value = StatsValue {
            rx_packets: 1,
            rx_bytes: 1_500,
            tx_packets: 2,
            tx_bytes: 120,
        };
        map.insert_entry(&key, &value).unwrap();
        assert_eq!(map.get_value(&key).unwrap(), Some(value));
        assert_eq!(map.get_first_key().unwrap(), Some(key));
    }

    #[test]
    fn stores_share_the_registry_handle() {
        let (_fs, registry, map) = open_u32(16);
        let other: BpfMap<u32, u32> = BpfMap::open(&registry, PATH, AccessMode::ReadWrite).unwrap();
        map.insert_entry(&1, &1).unwrap();
        assert_eq!(other.get_value(&1).unwrap(), Some(1));
        assert_eq!(registry.handle_count(), 1);
    }

    #[test]
    fn read_only_store_cannot_write() {
        let (_fs, registry, map) = open_u32(16);
        map.insert_entry(&1, &1).unwrap();
        let ro: BpfMap<u32, u32> = BpfMap::open(&registry, PATH, AccessMode::ReadOnly).unwrap();

        assert_eq!(ro.get_value(&1).unwrap(), Some(1));
        let err = ro.update_entry(&1, &2).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPERM));
    }

    #[test]
    fn mismatched_layout_is_rejected() {
        let (_fs, registry, _map) = open_u32(16);
        let err = BpfMap::<u64, u32>::open(&registry, PATH, AccessMode::ReadWrite).unwrap_err();
        assert!(matches!(err, Error::ResourceUnavailable { .. }));

        let handle = registry.obtain(PATH, AccessMode::ReadWrite, 4, 4).unwrap();
        assert!(matches!(
            BpfMap::<u32, u64>::from_handle(handle),
            Err(Error::Codec {
                expected: 8,
                actual: 4
            })
        ));
    }
}
