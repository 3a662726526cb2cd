//! Lightweight fetch profiling counters.
//!
//! Best-effort, node-local counters exposed so an operator can judge cache
//! effectiveness and cross-shard traffic. Relaxed ordering throughout; these
//! never participate in control flow.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the fetch counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchSnapshot {
    /// Total node lookups issued through the coordinator.
    pub total: u64,
    /// Lookups for nodes not owned by this shard.
    pub nonlocal: u64,
    /// Non-local lookups that also missed the cache.
    pub cache_miss: u64,
}

/// Counters updated by the remote-fetch coordinator.
#[derive(Debug, Default)]
pub struct FetchStats {
    total: AtomicU64,
    nonlocal: AtomicU64,
    cache_miss: AtomicU64,
}

impl FetchStats {
    pub fn record_total(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_nonlocal(&self, n: u64) {
        self.nonlocal.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self, n: u64) {
        self.cache_miss.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FetchSnapshot {
        FetchSnapshot {
            total: self.total.load(Ordering::Relaxed),
            nonlocal: self.nonlocal.load(Ordering::Relaxed),
            cache_miss: self.cache_miss.load(Ordering::Relaxed),
        }
    }
}
