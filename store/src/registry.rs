//! Map handle registry
//!
//! Opening a pinned map costs a syscall and a descriptor, so handles are
//! shared: one per `(path, mode, key size, value size)` identity for the
//! lifetime of the registry. The registry also owns the single-writer
//! instances, one per `(path, key type, value type)`.
//!
//! Registries are plain values. Tests build isolated ones over a
//! `MemoryMapFs`; production code can use [`MapRegistry::system`].

use crate::{
    error::{Error, Result},
    kernel::{AccessMode, KernelMap},
    sys::SysOpener,
};
use log::debug;
use map_common::constants::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

/// Something that can open a map by path
pub trait MapOpener: Send + Sync + fmt::Debug {
    /// Open the map at `path`, failing with `ResourceUnavailable` if it is
    /// missing or its geometry differs from `key_size`/`value_size`
    fn open(
        &self,
        path: &str,
        mode: AccessMode,
        key_size: u32,
        value_size: u32,
    ) -> Result<Arc<dyn KernelMap>>;
}

/// Cache identity of a handle
///
/// Sizes are masked to 10 and 16 bits before packing, so a 1028-byte key
/// shares an identity with a 4-byte key. The masked sizes are also what
/// gets opened, which makes the kernel's geometry check reject them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandleKey {
    path: String,
    identity: u32,
}

impl HandleKey {
    fn new(path: &str, mode: AccessMode, key_size: u32, value_size: u32) -> Self {
        let identity = ((mode.flags() >> 3) << 26) ^ (key_size << 16) ^ value_size;
        Self {
            path: path.to_string(),
            identity,
        }
    }
}

static SYSTEM: Lazy<MapRegistry> = Lazy::new(|| MapRegistry::new(SysOpener));

/// Process-scoped cache of open map handles and single-writer instances
#[derive(Debug)]
pub struct MapRegistry {
    opener: Box<dyn MapOpener>,
    handles: RwLock<HashMap<HandleKey, Arc<dyn KernelMap>>>,
    /// Serializes opens so an identity is never opened twice
    open_lock: Mutex<()>,
    single_writers: Mutex<HashMap<(String, TypeId), Arc<dyn Any + Send + Sync>>>,
}

impl MapRegistry {
    /// Create an empty registry
    ///
    /// # Arguments
    ///
    /// * `opener` - Backend used to open maps on a cache miss
    pub fn new(opener: impl MapOpener + 'static) -> Self {
        Self {
            opener: Box::new(opener),
            handles: RwLock::new(HashMap::new()),
            open_lock: Mutex::new(()),
            single_writers: Mutex::new(HashMap::new()),
        }
    }

    /// Registry over bpffs, shared by the whole process
    pub fn system() -> &'static MapRegistry {
        &SYSTEM
    }

    /// Get the handle for a map identity, opening it on first use
    ///
    /// An exclusive request fails with `Busy` whenever the identity is
    /// already cached, including by an earlier exclusive request.
    ///
    /// # Arguments
    ///
    /// * `path` - Pin path in bpffs
    /// * `mode` - Access mode; part of the identity
    /// * `key_size` - Key size in bytes, masked to 10 bits
    /// * `value_size` - Value size in bytes, masked to 16 bits
    pub fn obtain(
        &self,
        path: &str,
        mode: AccessMode,
        key_size: u32,
        value_size: u32,
    ) -> Result<Arc<dyn KernelMap>> {
        let key_size = key_size & MAX_KEY_SIZE;
        let value_size = value_size & MAX_VALUE_SIZE;
        let key = HandleKey::new(path, mode, key_size, value_size);

        // Lock-free of other opens for identities already cached
        if let Some(handle) = self.cached(&key, mode)? {
            return Ok(handle);
        }

        let _open = self.open_lock.lock();
        if let Some(handle) = self.cached(&key, mode)? {
            return Ok(handle);
        }

        let handle = self.opener.open(path, mode, key_size, value_size)?;
        debug!("cached handle for {} ({}, {}/{})", path, mode, key_size, value_size);
        self.handles.write().insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    fn cached(&self, key: &HandleKey, mode: AccessMode) -> Result<Option<Arc<dyn KernelMap>>> {
        match self.handles.read().get(key) {
            Some(_) if mode == AccessMode::ExclusiveReadWrite => Err(Error::Busy {
                path: key.path.clone(),
            }),
            Some(handle) => Ok(Some(Arc::clone(handle))),
            None => Ok(None),
        }
    }

    /// Number of distinct handle identities opened so far
    pub fn handle_count(&self) -> usize {
        self.handles.read().len()
    }

    /// Return the instance of `T` registered for `path`, creating it once
    ///
    /// `create` runs with the singleton table locked, so concurrent callers
    /// for the same slot wait for the first one and then share its result.
    pub(crate) fn singleton<T, F>(&self, path: &str, create: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        let slot = (path.to_string(), TypeId::of::<T>());
        let mut single_writers = self.single_writers.lock();
        if let Some(existing) = single_writers.get(&slot) {
            return Arc::clone(existing).downcast::<T>().map_err(|_| {
                Error::InvariantViolation(format!("singleton slot for {} holds another type", path))
            });
        }

        let instance = Arc::new(create()?);
        single_writers.insert(slot, Arc::clone(&instance) as Arc<dyn Any + Send + Sync>);
        Ok(instance)
    }
}
