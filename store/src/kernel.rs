//! Byte-level kernel map boundary
//!
//! `KernelMap` is what a BPF map looks like from userspace once it is open:
//! fixed-size byte keys and values, three update disciplines, and
//! get-next-key iteration. The `sys` module backs it with bpf(2), the
//! `memory` module with an in-process table.

use crate::error::Result;
use map_common::constants::{
    BPF_ANY, BPF_EXIST, BPF_F_RDONLY, BPF_F_RDWR, BPF_F_RDWR_EXCL, BPF_F_WRONLY, BPF_NOEXIST,
};
use std::fmt;

/// How a map handle is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
    WriteOnly,
    /// Read-write, and no other handle to the same map may exist
    ExclusiveReadWrite,
}

impl AccessMode {
    /// Open flag value, including the in-process exclusive marker
    pub fn flags(self) -> u32 {
        match self {
            AccessMode::ReadWrite => BPF_F_RDWR,
            AccessMode::ReadOnly => BPF_F_RDONLY,
            AccessMode::WriteOnly => BPF_F_WRONLY,
            AccessMode::ExclusiveReadWrite => BPF_F_RDWR_EXCL,
        }
    }

    /// Flags to hand the kernel; exclusivity is enforced in userspace
    pub fn kernel_flags(self) -> u32 {
        match self {
            AccessMode::ExclusiveReadWrite => BPF_F_RDWR,
            other => other.flags(),
        }
    }

    /// Whether lookups and key iteration are allowed
    pub fn can_read(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    /// Whether updates and deletes are allowed
    pub fn can_write(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessMode::ReadWrite => "rw",
            AccessMode::ReadOnly => "ro",
            AccessMode::WriteOnly => "wo",
            AccessMode::ExclusiveReadWrite => "rw-excl",
        };
        f.write_str(name)
    }
}

/// Update discipline for `BPF_MAP_UPDATE_ELEM`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlag {
    /// Insert or replace
    Any,
    /// Insert only; fails with `AlreadyExists`
    NoExist,
    /// Replace only; fails with `NotFound`
    Exist,
}

impl UpdateFlag {
    /// Flag value passed to `BPF_MAP_UPDATE_ELEM`
    pub fn bits(self) -> u64 {
        match self {
            UpdateFlag::Any => BPF_ANY,
            UpdateFlag::NoExist => BPF_NOEXIST,
            UpdateFlag::Exist => BPF_EXIST,
        }
    }
}

/// An open kernel map, addressed with raw bytes
///
/// Implementations are shared between threads and between every store
/// built on the same handle identity, so all methods take `&self`.
pub trait KernelMap: Send + Sync + fmt::Debug {
    /// Pin path the handle was opened from
    fn path(&self) -> &str;

    /// Key size in bytes
    fn key_size(&self) -> usize;

    /// Value size in bytes
    fn value_size(&self) -> usize;

    /// Look up a key; `Ok(None)` when absent
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write a value under the given discipline
    fn update(&self, key: &[u8], value: &[u8], flag: UpdateFlag) -> Result<()>;

    /// Delete a key; `Ok(false)` when it was not present
    fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Key following `key` in kernel order
    ///
    /// `None` asks for the first key. A `key` that is not in the map also
    /// yields the first key. `Ok(None)` means there is no next key.
    fn next_key(&self, key: Option<&[u8]>) -> Result<Option<Vec<u8>>>;
}
