//! Fixed-size key/value encoding
//!
//! Every key and value stored in a BPF map has a size known at compile
//! time. Any `aya::Pod` type (primitives, arrays, the repr(C) structs in
//! `map_common`) gets the encoding for free: its bytes in native order.

use crate::error::{Error, Result};
use aya::Pod;
use std::{marker::PhantomData, mem, ptr, slice};

/// A type with a fixed native-order byte layout
pub trait FixedLayout: Sized + Copy + Send + Sync + 'static {
    /// Serialized size in bytes
    const SIZE: usize;

    /// Encode into exactly `SIZE` bytes
    fn encode(&self) -> Vec<u8>;

    /// Decode from exactly `SIZE` bytes
    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl<T: Pod + Send + Sync> FixedLayout for T {
    const SIZE: usize = mem::size_of::<T>();

    fn encode(&self) -> Vec<u8> {
        // SAFETY: Pod types are plain data with no padding invariants
        let bytes = unsafe { slice::from_raw_parts(self as *const T as *const u8, Self::SIZE) };
        bytes.to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::Codec {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        // SAFETY: length checked above, any bit pattern is a valid Pod
        Ok(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }
}

/// Compile-time checks on a key/value pair
///
/// Referencing `LayoutCheck::<K, V>::VALID` fails the build for zero-sized
/// layouts, which the kernel rejects as map geometry.
pub(crate) struct LayoutCheck<K, V>(PhantomData<(K, V)>);

impl<K: FixedLayout, V: FixedLayout> LayoutCheck<K, V> {
    pub(crate) const VALID: () = {
        assert!(K::SIZE > 0, "map keys must not be zero-sized");
        assert!(V::SIZE > 0, "map values must not be zero-sized");
    };
}
