//! Error types
//!
//! Kernel errnos are classified into the kinds callers actually branch on;
//! anything else is surfaced as a raw syscall failure.

use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by map handles, stores, caches and counters
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The map could not be located or opened (missing pin, permissions, geometry)
    #[error("map {path} is unavailable: {source}")]
    ResourceUnavailable {
        path: String,
        #[source]
        source: io::Error,
    },

    /// An exclusive open was requested for a map that is already open
    #[error("map {path} is already open")]
    Busy { path: String },

    /// Insert-if-absent found an existing key
    #[error("key already exists")]
    AlreadyExists,

    /// Replace-if-present found no matching key
    #[error("key not found")]
    NotFound,

    /// A bounded counter would exceed its ceiling
    #[error("{key} exceeded its allowed limit of {max}")]
    CapacityExceeded { key: String, max: u32 },

    /// A caller broke a usage contract (e.g. unbalanced decrement)
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A buffer did not have the size the layout requires
    #[error("expected {expected} bytes, got {actual}")]
    Codec { expected: usize, actual: usize },

    /// Any other kernel failure
    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// Bad construction parameter
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Classify an errno returned by a map element operation
    pub(crate) fn from_errno(call: &'static str, errno: i32) -> Self {
        match errno {
            libc::EEXIST => Error::AlreadyExists,
            libc::ENOENT => Error::NotFound,
            _ => Error::Syscall {
                call,
                source: io::Error::from_raw_os_error(errno),
            },
        }
    }

    /// Raw OS error code, if this error came from the kernel
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::AlreadyExists => Some(libc::EEXIST),
            Error::NotFound => Some(libc::ENOENT),
            Error::Busy { .. } => Some(libc::EBUSY),
            Error::ResourceUnavailable { source, .. } | Error::Syscall { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_element_errnos() {
        assert!(matches!(
            Error::from_errno("BPF_MAP_UPDATE_ELEM", libc::EEXIST),
            Error::AlreadyExists
        ));
        assert!(matches!(
            Error::from_errno("BPF_MAP_UPDATE_ELEM", libc::ENOENT),
            Error::NotFound
        ));

        let err = Error::from_errno("BPF_MAP_UPDATE_ELEM", libc::E2BIG);
        assert_eq!(err.raw_os_error(), Some(libc::E2BIG));
        assert!(err.to_string().starts_with("BPF_MAP_UPDATE_ELEM failed"));
    }
}
