//! Typed access to pinned BPF maps
//!
//! Provides typed key/value stores over maps pinned in bpffs, a
//! write-through cached variant for maps with a single userspace writer,
//! and two small utilities used alongside them: an expiring LRU cache and
//! a bounded per-UID counter.

pub mod codec;
pub mod counter;
pub mod dump;
pub mod error;
pub mod kernel;
pub mod lru;
pub mod map;
pub mod memory;
pub mod registry;
pub mod single_writer;
pub mod sys;

pub use codec::FixedLayout;
pub use counter::PerUidCounter;
pub use dump::{dump_map, DumpExporter, ExporterType, JsonExporter, MapDump, TextExporter};
pub use error::{Error, Result};
pub use kernel::{AccessMode, KernelMap, UpdateFlag};
pub use lru::{Clock, LruCacheWithExpiry, MonotonicClock};
pub use map::{BpfMap, MapEntry, MapStore};
pub use memory::MemoryMapFs;
pub use registry::{MapOpener, MapRegistry};
pub use single_writer::SingleWriterBpfMap;
