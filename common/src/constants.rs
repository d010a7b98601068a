//! Shared constants for pinned BPF maps
//!
//! Kernel ABI flag values and the geometry of the well-known maps,
//! used by both the BPF programs and the userspace store.

// ============================================================================
// Open Flags (for BPF_OBJ_GET file_flags)
// ============================================================================

/// Open the map for reading and writing
pub const BPF_F_RDWR: u32 = 0;

/// Open the map read-only
pub const BPF_F_RDONLY: u32 = 1 << 3;

/// Open the map write-only
pub const BPF_F_WRONLY: u32 = 1 << 4;

/// Exclusive read-write open
///
/// Not a kernel flag: RDONLY|WRONLY is rejected by the kernel, so the value
/// is free to mean "read-write, and nobody else may hold it".
pub const BPF_F_RDWR_EXCL: u32 = BPF_F_RDONLY | BPF_F_WRONLY;

// ============================================================================
// Update Flags (for BPF_MAP_UPDATE_ELEM)
// ============================================================================

/// Create a new element or update an existing one
pub const BPF_ANY: u64 = 0;

/// Create a new element only if it did not exist
pub const BPF_NOEXIST: u64 = 1;

/// Update an existing element only
pub const BPF_EXIST: u64 = 2;

// ============================================================================
// Size Limits
// ============================================================================

/// Largest key size representable in a cached handle identity (10 bits)
pub const MAX_KEY_SIZE: u32 = 1023;

/// Largest value size representable in a cached handle identity (16 bits)
pub const MAX_VALUE_SIZE: u32 = 65535;

// ============================================================================
// Well-known Pin Paths
// ============================================================================

/// Per-UID statistics, A side of the double buffer
pub const STATS_MAP_A_PATH: &str = "/sys/fs/bpf/netd_shared/map_netd_stats_map_A";

/// Per-UID statistics, B side of the double buffer
pub const STATS_MAP_B_PATH: &str = "/sys/fs/bpf/netd_shared/map_netd_stats_map_B";

/// Socket cookie -> (uid, tag)
pub const COOKIE_TAG_MAP_PATH: &str = "/sys/fs/bpf/netd_shared/map_netd_cookie_tag_map";

/// UID -> firewall rule
pub const UID_OWNER_MAP_PATH: &str = "/sys/fs/bpf/netd_shared/map_netd_uid_owner_map";

/// Interface index -> interface name
pub const IFACE_INDEX_NAME_MAP_PATH: &str =
    "/sys/fs/bpf/netd_shared/map_netd_iface_index_name_map";

/// Geometry of a well-known map
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KnownMap {
    pub path: &'static str,
    pub key_size: u32,
    pub value_size: u32,
}

/// Pin paths with their key and value sizes
pub const KNOWN_MAPS: &[KnownMap] = &[
    KnownMap {
        path: STATS_MAP_A_PATH,
        key_size: 16,
        value_size: 32,
    },
    KnownMap {
        path: STATS_MAP_B_PATH,
        key_size: 16,
        value_size: 32,
    },
    KnownMap {
        path: COOKIE_TAG_MAP_PATH,
        key_size: 8,
        value_size: 8,
    },
    KnownMap {
        path: UID_OWNER_MAP_PATH,
        key_size: 4,
        value_size: 8,
    },
    KnownMap {
        path: IFACE_INDEX_NAME_MAP_PATH,
        key_size: 4,
        value_size: 16,
    },
];

/// Look up the geometry of a well-known map by pin path
pub fn known_map(path: &str) -> Option<&'static KnownMap> {
    KNOWN_MAPS.iter().find(|m| m.path == path)
}
