//! Bounded per-UID usage counter
//!
//! Tracks how many of some resource each UID holds and refuses to let any
//! UID go past a ceiling. Keys whose count drops back to zero are forgotten.

use crate::error::{Error, Result};
use log::error;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, hash::Hash};

/// Per-key counts capped at a fixed ceiling
#[derive(Debug)]
pub struct PerUidCounter<K = u32> {
    max_per_key: u32,
    counts: Mutex<HashMap<K, u32>>,
}

impl<K> PerUidCounter<K>
where
    K: Hash + Eq + Clone + fmt::Display,
{
    /// Create a new counter
    ///
    /// # Arguments
    ///
    /// * `max_per_key` - Highest count any single key may reach
    ///
    /// # Returns
    ///
    /// The counter, or `InvalidArgument` if `max_per_key` is zero
    pub fn new(max_per_key: u32) -> Result<Self> {
        if max_per_key < 1 {
            return Err(Error::InvalidArgument(format!(
                "max count per key must be at least 1, got {}",
                max_per_key
            )));
        }
        Ok(Self {
            max_per_key,
            counts: Mutex::new(HashMap::new()),
        })
    }

    /// Ceiling applied to every key
    pub fn max_per_key(&self) -> u32 {
        self.max_per_key
    }

    /// Take one unit for `key`; at the ceiling the count is left untouched
    pub fn increment_count_or_throw(&self, key: K) -> Result<()> {
        let mut counts = self.counts.lock();
        let current = counts.get(&key).copied().unwrap_or(0);
        if current >= self.max_per_key {
            return Err(Error::CapacityExceeded {
                key: format!("uid {}", key),
                max: self.max_per_key,
            });
        }
        counts.insert(key, current + 1);
        Ok(())
    }

    /// Release one unit for `key`
    ///
    /// Releasing more than was taken is a caller bug: it is logged loudly and
    /// reported, and the count stays at zero.
    pub fn decrement_count_or_throw(&self, key: K) -> Result<()> {
        let mut counts = self.counts.lock();
        match counts.get(&key).copied().unwrap_or(0) {
            0 => {
                error!("BUG: too small count -1 for uid {}", key);
                Err(Error::InvariantViolation(format!(
                    "too small count -1 for uid {}",
                    key
                )))
            }
            1 => {
                counts.remove(&key);
                Ok(())
            }
            n => {
                counts.insert(key, n - 1);
                Ok(())
            }
        }
    }

    /// Current count for `key`, zero when untracked
    pub fn get(&self, key: &K) -> u32 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }

    /// Keys with a non-zero count
    pub fn tracked_keys(&self) -> Vec<K> {
        self.counts.lock().keys().cloned().collect()
    }
}
