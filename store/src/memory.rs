//! In-process map backend
//!
//! `MemoryMapFs` behaves like a bpffs mount holding hash maps: maps are
//! created at a path with fixed geometry, opened with an access mode, and
//! follow the kernel's element semantics (including get-next-key on an
//! absent key restarting at the first key). Keys iterate in byte order.

use crate::{
    error::{Error, Result},
    kernel::{AccessMode, KernelMap, UpdateFlag},
    registry::MapOpener,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    io,
    ops::Bound,
    sync::Arc,
};

#[derive(Debug)]
struct MapTable {
    key_size: usize,
    value_size: usize,
    max_entries: usize,
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

/// A set of named in-memory maps, shared by every clone
#[derive(Debug, Default, Clone)]
pub struct MemoryMapFs {
    maps: Arc<Mutex<HashMap<String, Arc<MapTable>>>>,
}

impl MemoryMapFs {
    /// Create an empty set of maps
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map at `path`
    pub fn create(
        &self,
        path: &str,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Result<()> {
        if key_size == 0 || value_size == 0 || max_entries == 0 {
            return Err(Error::InvalidArgument(format!(
                "map geometry {}/{}/{} must be non-zero",
                key_size, value_size, max_entries
            )));
        }
        let mut maps = self.maps.lock();
        if maps.contains_key(path) {
            return Err(Error::Syscall {
                call: "BPF_OBJ_PIN",
                source: io::Error::from_raw_os_error(libc::EEXIST),
            });
        }
        maps.insert(
            path.to_string(),
            Arc::new(MapTable {
                key_size: key_size as usize,
                value_size: value_size as usize,
                max_entries: max_entries as usize,
                entries: Mutex::new(BTreeMap::new()),
            }),
        );
        Ok(())
    }

    /// Unpin a map; open handles keep working
    pub fn remove(&self, path: &str) -> bool {
        self.maps.lock().remove(path).is_some()
    }

    /// Number of entries in the map at `path`
    pub fn entry_count(&self, path: &str) -> Option<usize> {
        let maps = self.maps.lock();
        maps.get(path).map(|table| table.entries.lock().len())
    }

    /// Open a handle to the map at `path`
    pub fn open_map(
        &self,
        path: &str,
        mode: AccessMode,
        key_size: u32,
        value_size: u32,
    ) -> Result<MemoryMap> {
        let table = self
            .maps
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::ResourceUnavailable {
                path: path.to_string(),
                source: io::Error::from_raw_os_error(libc::ENOENT),
            })?;

        if table.key_size != key_size as usize || table.value_size != value_size as usize {
            return Err(Error::ResourceUnavailable {
                path: path.to_string(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "map has key/value size {}/{}, expected {}/{}",
                        table.key_size, table.value_size, key_size, value_size
                    ),
                ),
            });
        }

        Ok(MemoryMap {
            table,
            path: path.to_string(),
            mode,
        })
    }
}

impl MapOpener for MemoryMapFs {
    fn open(
        &self,
        path: &str,
        mode: AccessMode,
        key_size: u32,
        value_size: u32,
    ) -> Result<Arc<dyn KernelMap>> {
        let map = self.open_map(path, mode, key_size, value_size)?;
        Ok(Arc::new(map))
    }
}

/// A handle onto one map of a `MemoryMapFs`
#[derive(Debug)]
pub struct MemoryMap {
    table: Arc<MapTable>,
    path: String,
    mode: AccessMode,
}

impl MemoryMap {
    fn permission_denied(call: &'static str) -> Error {
        Error::Syscall {
            call,
            source: io::Error::from_raw_os_error(libc::EPERM),
        }
    }

    fn check_len(expected: usize, bytes: &[u8]) -> Result<()> {
        if bytes.len() != expected {
            return Err(Error::Codec {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(())
    }
}

impl KernelMap for MemoryMap {
    fn path(&self) -> &str {
        &self.path
    }

    fn key_size(&self) -> usize {
        self.table.key_size
    }

    fn value_size(&self) -> usize {
        self.table.value_size
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.mode.can_read() {
            return Err(Self::permission_denied("BPF_MAP_LOOKUP_ELEM"));
        }
        Self::check_len(self.table.key_size, key)?;
        Ok(self.table.entries.lock().get(key).cloned())
    }

    fn update(&self, key: &[u8], value: &[u8], flag: UpdateFlag) -> Result<()> {
        if !self.mode.can_write() {
            return Err(Self::permission_denied("BPF_MAP_UPDATE_ELEM"));
        }
        Self::check_len(self.table.key_size, key)?;
        Self::check_len(self.table.value_size, value)?;

        let mut entries = self.table.entries.lock();
        let exists = entries.contains_key(key);
        match flag {
            UpdateFlag::NoExist if exists => return Err(Error::AlreadyExists),
            UpdateFlag::Exist if !exists => return Err(Error::NotFound),
            _ => {}
        }
        if !exists && entries.len() >= self.table.max_entries {
            return Err(Error::from_errno("BPF_MAP_UPDATE_ELEM", libc::E2BIG));
        }
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        if !self.mode.can_write() {
            return Err(Self::permission_denied("BPF_MAP_DELETE_ELEM"));
        }
        Self::check_len(self.table.key_size, key)?;
        Ok(self.table.entries.lock().remove(key).is_some())
    }

    fn next_key(&self, key: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        if !self.mode.can_read() {
            return Err(Self::permission_denied("BPF_MAP_GET_NEXT_KEY"));
        }
        let entries = self.table.entries.lock();
        let next = match key {
            Some(k) => {
                Self::check_len(self.table.key_size, k)?;
                if entries.contains_key(k) {
                    entries
                        .range::<[u8], _>((Bound::Excluded(k), Bound::Unbounded))
                        .next()
                } else {
                    entries.iter().next()
                }
            }
            None => entries.iter().next(),
        };
        Ok(next.map(|(k, _)| k.clone()))
    }
}
