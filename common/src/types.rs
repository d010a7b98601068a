//! Shared key/value layouts for pinned BPF maps
//!
//! These structures must be repr(C) so the bytes userspace writes match
//! what the BPF programs read. Fields are in host byte order unless noted.

/// Key of the per-UID traffic statistics maps
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatsKey {
    /// Application UID
    pub uid: u32,
    /// Socket tag set by the application (0 = untagged)
    pub tag: u32,
    /// Counter set (foreground/background)
    pub counter_set: u32,
    /// Kernel interface index
    pub iface_index: u32,
}

/// Value of the per-UID traffic statistics maps
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StatsValue {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

impl StatsValue {
    /// Add another sample to this one, wrapping on overflow like the kernel side does
    pub fn accumulate(&mut self, other: &StatsValue) {
        self.rx_packets = self.rx_packets.wrapping_add(other.rx_packets);
        self.rx_bytes = self.rx_bytes.wrapping_add(other.rx_bytes);
        self.tx_packets = self.tx_packets.wrapping_add(other.tx_packets);
        self.tx_bytes = self.tx_bytes.wrapping_add(other.tx_bytes);
    }
}

/// Value of the socket cookie -> tag map
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CookieTagValue {
    pub uid: u32,
    pub tag: u32,
}

/// Value of the UID owner (firewall rule) map
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct UidOwnerValue {
    /// Allowed input interface index (0 = any)
    pub iif: u32,
    /// Bitmask of firewall match rules
    pub rule: u32,
}

/// Value of the interface index -> name map
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IfaceValue {
    /// NUL padded interface name
    pub name: [u8; 16],
}

impl IfaceValue {
    /// Build a value from an interface name, truncating to 15 bytes
    pub fn from_name(name: &str) -> Self {
        let mut value = Self::default();
        let bytes = name.as_bytes();
        let len = core::cmp::min(bytes.len(), value.name.len() - 1);
        value.name[..len].copy_from_slice(&bytes[..len]);
        value
    }

    /// Interface name without trailing NUL padding
    pub fn name(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..end]
    }
}

// Compile-time layout checks
// These fail to compile if a struct picks up implicit padding
const _: () = {
    assert!(core::mem::size_of::<StatsKey>() == 16);
    assert!(core::mem::size_of::<StatsValue>() == 32);
    assert!(core::mem::size_of::<CookieTagValue>() == 8);
    assert!(core::mem::size_of::<UidOwnerValue>() == 8);
    assert!(core::mem::size_of::<IfaceValue>() == 16);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    // Pod trait implementations for reading and writing map entries in userspace
    unsafe impl aya::Pod for StatsKey {}
    unsafe impl aya::Pod for StatsValue {}
    unsafe impl aya::Pod for CookieTagValue {}
    unsafe impl aya::Pod for UidOwnerValue {}
    unsafe impl aya::Pod for IfaceValue {}
}
