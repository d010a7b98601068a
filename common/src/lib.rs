//! Shared types and constants for pinned BPF maps
//!
//! This crate provides the key/value layouts and map geometry shared
//! between BPF programs and the userspace map store.

#![no_std]

pub mod types;
pub mod constants;

// Re-export commonly used types
pub use types::{CookieTagValue, IfaceValue, StatsKey, StatsValue, UidOwnerValue};
pub use constants::*;
