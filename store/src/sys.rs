//! bpf(2) backed map handles
//!
//! Opens pinned maps with `BPF_OBJ_GET` and drives element operations
//! through the raw syscall, so the open mode and the get-next-key cursor
//! are under our control rather than a loader's.

use crate::{
    error::{Error, Result},
    kernel::{AccessMode, KernelMap, UpdateFlag},
    registry::MapOpener,
};
use log::debug;
use std::{
    ffi::CString,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::Arc,
};

const BPF_MAP_LOOKUP_ELEM: u32 = 1;
const BPF_MAP_UPDATE_ELEM: u32 = 2;
const BPF_MAP_DELETE_ELEM: u32 = 3;
const BPF_MAP_GET_NEXT_KEY: u32 = 4;
const BPF_OBJ_GET: u32 = 7;
const BPF_OBJ_GET_INFO_BY_FD: u32 = 15;

#[repr(C)]
struct BpfAttrObjGet {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
struct BpfAttrMapElem {
    map_fd: u32,
    _pad: u32,
    key: u64,
    /// `value` for lookup/update, `next_key` for get-next-key
    value: u64,
    flags: u64,
}

#[repr(C)]
struct BpfAttrObjGetInfoByFd {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

/// Leading fields of `struct bpf_map_info`; the kernel copies at most `info_len`
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct BpfMapInfo {
    map_type: u32,
    id: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    name: [u8; 16],
}

fn bpf_syscall<T>(cmd: u32, attr: &mut T) -> io::Result<libc::c_long> {
    // SAFETY: attr is a live repr(C) bpf_attr prefix of the advertised size
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd as libc::c_long,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>() as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn map_info(fd: &OwnedFd) -> io::Result<BpfMapInfo> {
    let mut info = BpfMapInfo::default();
    let mut attr = BpfAttrObjGetInfoByFd {
        bpf_fd: fd.as_raw_fd() as u32,
        info_len: mem::size_of::<BpfMapInfo>() as u32,
        info: &mut info as *mut BpfMapInfo as u64,
    };
    bpf_syscall(BPF_OBJ_GET_INFO_BY_FD, &mut attr)?;
    Ok(info)
}

/// A pinned map opened through bpf(2)
#[derive(Debug)]
pub struct PinnedMap {
    fd: OwnedFd,
    path: String,
    key_size: usize,
    value_size: usize,
}

impl PinnedMap {
    /// Open a pinned map, verifying its key and value sizes
    ///
    /// Exclusive mode opens the map read-write; exclusivity is enforced by
    /// the handle cache in [`MapRegistry`](crate::registry::MapRegistry).
    ///
    /// # Arguments
    ///
    /// * `path` - Pin path in bpffs
    /// * `mode` - Access mode to request
    /// * `key_size` - Expected key size in bytes
    /// * `value_size` - Expected value size in bytes
    ///
    /// # Returns
    ///
    /// The open map, or `ResourceUnavailable` if it is missing, inaccessible
    /// or has a different geometry
    pub fn open(path: &str, mode: AccessMode, key_size: u32, value_size: u32) -> Result<Self> {
        let unavailable = |source: io::Error| Error::ResourceUnavailable {
            path: path.to_string(),
            source,
        };

        let c_path = CString::new(path)
            .map_err(|_| Error::InvalidArgument(format!("pin path contains NUL: {:?}", path)))?;
        let mut attr = BpfAttrObjGet {
            pathname: c_path.as_ptr() as u64,
            bpf_fd: 0,
            file_flags: mode.kernel_flags(),
        };
        let raw = bpf_syscall(BPF_OBJ_GET, &mut attr).map_err(unavailable)?;
        // SAFETY: BPF_OBJ_GET returned a fresh descriptor we now own
        let fd = unsafe { OwnedFd::from_raw_fd(raw as RawFd) };

        let info = map_info(&fd).map_err(unavailable)?;
        if info.key_size != key_size || info.value_size != value_size {
            return Err(unavailable(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "map has key/value size {}/{}, expected {}/{}",
                    info.key_size, info.value_size, key_size, value_size
                ),
            )));
        }

        debug!(
            "opened {} ({}) id={} key={} value={} max_entries={}",
            path, mode, info.id, info.key_size, info.value_size, info.max_entries
        );

        Ok(Self {
            fd,
            path: path.to_string(),
            key_size: key_size as usize,
            value_size: value_size as usize,
        })
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(Error::Codec {
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }

    fn elem_attr(&self, key: u64, value: u64, flags: u64) -> BpfAttrMapElem {
        BpfAttrMapElem {
            map_fd: self.fd.as_raw_fd() as u32,
            _pad: 0,
            key,
            value,
            flags,
        }
    }
}

impl KernelMap for PinnedMap {
    fn path(&self) -> &str {
        &self.path
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn value_size(&self) -> usize {
        self.value_size
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        let mut value = vec![0u8; self.value_size];
        let mut attr = self.elem_attr(key.as_ptr() as u64, value.as_mut_ptr() as u64, 0);
        match bpf_syscall(BPF_MAP_LOOKUP_ELEM, &mut attr) {
            Ok(_) => Ok(Some(value)),
            Err(e) => match Error::from_errno("BPF_MAP_LOOKUP_ELEM", errno_of(&e)) {
                Error::NotFound => Ok(None),
                other => Err(other),
            },
        }
    }

    fn update(&self, key: &[u8], value: &[u8], flag: UpdateFlag) -> Result<()> {
        self.check_key(key)?;
        if value.len() != self.value_size {
            return Err(Error::Codec {
                expected: self.value_size,
                actual: value.len(),
            });
        }
        let mut attr = self.elem_attr(key.as_ptr() as u64, value.as_ptr() as u64, flag.bits());
        bpf_syscall(BPF_MAP_UPDATE_ELEM, &mut attr)
            .map(|_| ())
            .map_err(|e| Error::from_errno("BPF_MAP_UPDATE_ELEM", errno_of(&e)))
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        let mut attr = self.elem_attr(key.as_ptr() as u64, 0, 0);
        match bpf_syscall(BPF_MAP_DELETE_ELEM, &mut attr) {
            Ok(_) => Ok(true),
            Err(e) => match Error::from_errno("BPF_MAP_DELETE_ELEM", errno_of(&e)) {
                Error::NotFound => Ok(false),
                other => Err(other),
            },
        }
    }

    fn next_key(&self, key: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let key_ptr = match key {
            Some(k) => {
                self.check_key(k)?;
                k.as_ptr() as u64
            }
            None => 0,
        };
        let mut next = vec![0u8; self.key_size];
        let mut attr = self.elem_attr(key_ptr, next.as_mut_ptr() as u64, 0);
        match bpf_syscall(BPF_MAP_GET_NEXT_KEY, &mut attr) {
            Ok(_) => Ok(Some(next)),
            Err(e) => match Error::from_errno("BPF_MAP_GET_NEXT_KEY", errno_of(&e)) {
                Error::NotFound => Ok(None),
                other => Err(other),
            },
        }
    }
}

/// Opens maps pinned in bpffs
#[derive(Debug, Default, Clone, Copy)]
pub struct SysOpener;

impl MapOpener for SysOpener {
    fn open(
        &self,
        path: &str,
        mode: AccessMode,
        key_size: u32,
        value_size: u32,
    ) -> Result<Arc<dyn KernelMap>> {
        let map = PinnedMap::open(path, mode, key_size, value_size)?;
        Ok(Arc::new(map))
    }
}
