//! Runtime configuration for a serving shard.

use serde::Deserialize;

use crate::cache::Policy;

/// Configuration for one graph-serving process.
///
/// All values have workable defaults; deployments typically only tune the
/// cache capacity and policy.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Capacity of each sampler's output (minibatch) queue.
    pub graph_queue_capacity: usize,
    /// Capacity of each tag's completed-state receive queue. Must exceed
    /// `server_buffer_size`: a completion callback pushes onto this queue
    /// from a transport thread and must never find it full.
    pub recv_queue_capacity: usize,
    /// Per-tag bound on sampling passes with outstanding remote work. A
    /// sampler asking for a new pass beyond this blocks until one completes.
    pub server_buffer_size: usize,
    /// Remote-node cache capacity in entries. Zero disables the cache.
    pub cache_capacity: usize,
    /// Eviction policy for the remote-node cache.
    pub cache_policy: Policy,
    /// Worker threads used by the in-process transport. Kept at two or more
    /// so a long-blocking minibatch pull cannot starve point pulls.
    pub transport_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            graph_queue_capacity: 32,
            recv_queue_capacity: 64,
            server_buffer_size: 32,
            cache_capacity: 0,
            cache_policy: Policy::Lru,
            transport_workers: 2,
        }
    }
}
