//! Single-slot TTL cache.
//!
//! Sits in front of the storage fetcher: storage capacity changes slowly and
//! the endpoint is expensive on large sites. Timestamps come from the tokio
//! clock, so expiry follows `tokio::time::pause`/`advance` in tests.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Entry<T> {
    value: T,
    written: Instant,
}

#[derive(Debug)]
struct Slot<T> {
    ttl: Duration,
    entry: Option<Entry<T>>,
}

/// Holds at most one value, valid for `ttl` after it was written.
///
/// A zero TTL disables the cache: `set` stores nothing and `get` always
/// misses. The lock is held only to copy the slot in or out.
#[derive(Debug)]
pub struct TtlCache<T: Clone> {
    slot: Mutex<Slot<T>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot { ttl, entry: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ttl(&self) -> Duration {
        self.lock().ttl
    }

    /// Changes the TTL. A value already cached is judged by the new TTL.
    pub fn set_ttl(&self, ttl: Duration) {
        let mut slot = self.lock();
        slot.ttl = ttl;
        if ttl.is_zero() {
            slot.entry = None;
        }
    }

    /// Returns the cached value if it is younger than the TTL.
    pub fn get(&self) -> Option<T> {
        let slot = self.lock();
        let ttl = slot.ttl;
        if ttl.is_zero() {
            return None;
        }
        slot.entry
            .as_ref()
            .filter(|entry| entry.written.elapsed() < ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn set(&self, value: T) {
        let mut slot = self.lock();
        if slot.ttl.is_zero() {
            return;
        }
        slot.entry = Some(Entry {
            value,
            written: Instant::now(),
        });
    }

    /// Drops the cached value.
    pub fn flush(&self) {
        self.lock().entry = None;
    }
}
