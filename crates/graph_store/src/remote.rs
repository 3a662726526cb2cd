//! Remote-fetch coordination: cache, cross-shard fan-out, and partial
//! response aggregation.
//!
//! Given a sampling pass with a set of globally identified nodes to resolve,
//! the coordinator serves locally owned nodes and cache hits immediately,
//! groups the true misses by owning shard, issues one pull per shard, and
//! republishes the pass onto its tag's receive queue once every group has
//! replied. A per-pass atomic counter makes completion exactly-once no
//! matter how replies interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::cache::{new_cache, EvictionCache, Policy};
use crate::error::{GraphError, Result};
use crate::queue::BoundedQueue;
use crate::state::SampleState;
use crate::stats::{FetchSnapshot, FetchStats};
use crate::transport::{NodePullRequest, NodePullResponse, Transport};
use crate::types::{NodeData, NodeId, Rank, SamplerKind, ShardStore, Tag};

/// Receive-queue item; the sentinel releases samplers blocked on an empty
/// queue during shutdown.
enum Incoming {
    State(Arc<SampleState>),
    Shutdown,
}

struct TagChannel {
    queue: Arc<BoundedQueue<Incoming>>,
    /// Sampling passes of this tag with outstanding remote work.
    in_flight: Arc<AtomicUsize>,
}

pub struct RemoteFetchCoordinator {
    store: Arc<ShardStore>,
    transport: Arc<dyn Transport>,
    cache: Mutex<Option<Box<dyn EvictionCache<NodeId, NodeData>>>>,
    channels: DashMap<Tag, TagChannel>,
    stats: FetchStats,
    /// Per-tag cap on passes with outstanding remote work; reaching it turns
    /// `get_sample_state` into a blocking wait (backpressure, not an error).
    buffer_limit: usize,
    recv_capacity: usize,
}

impl RemoteFetchCoordinator {
    pub fn new(
        store: Arc<ShardStore>,
        transport: Arc<dyn Transport>,
        buffer_limit: usize,
        recv_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            cache: Mutex::new(None),
            channels: DashMap::new(),
            stats: FetchStats::default(),
            buffer_limit,
            recv_capacity,
        })
    }

    /// Install the remote-node cache. May be called at most once; the policy
    /// is fixed for the cache's lifetime.
    pub fn init_cache(&self, capacity: usize, policy: Policy) -> Result<()> {
        let mut cache = self.cache.lock();
        if cache.is_some() {
            return Err(GraphError::CacheAlreadyInitialized);
        }
        *cache = Some(new_cache(policy, capacity));
        Ok(())
    }

    /// Create the receive queue and in-flight counter for a tag.
    pub fn register_tag(&self, tag: Tag) {
        self.channels.entry(tag).or_insert_with(|| TagChannel {
            queue: Arc::new(BoundedQueue::new(self.recv_capacity)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        });
    }

    fn channel(&self, tag: Tag) -> (Arc<BoundedQueue<Incoming>>, Arc<AtomicUsize>) {
        let entry = self
            .channels
            .get(&tag)
            .unwrap_or_else(|| panic!("tag {tag} was never registered"));
        (entry.queue.clone(), entry.in_flight.clone())
    }

    /// Hand the calling sampler a pass to work on.
    ///
    /// Prefers a completed pass from the receive queue; otherwise starts a
    /// fresh one unless too many passes already have remote work outstanding,
    /// in which case the call blocks until one completes. `None` means the
    /// tag is shutting down.
    pub fn get_sample_state(&self, tag: Tag, kind: SamplerKind) -> Option<Arc<SampleState>> {
        let (queue, in_flight) = self.channel(tag);
        if let Some(item) = queue.try_pop() {
            return self.resolve(item, &queue);
        }
        if in_flight.load(Ordering::Acquire) < self.buffer_limit {
            return Some(SampleState::new(tag, kind));
        }
        let item = queue.pop()?;
        self.resolve(item, &queue)
    }

    fn resolve(
        &self,
        item: Incoming,
        queue: &BoundedQueue<Incoming>,
    ) -> Option<Arc<SampleState>> {
        match item {
            Incoming::State(state) => Some(state),
            Incoming::Shutdown => {
                // Keep the sentinel alive for any sibling sampler on the tag.
                queue.push(Incoming::Shutdown);
                None
            }
        }
    }

    /// Release every sampler blocked on this tag's receive queue.
    pub fn shutdown_tag(&self, tag: Tag) {
        if let Some(entry) = self.channels.get(&tag) {
            entry.queue.push(Incoming::Shutdown);
        }
    }

    /// Resolve everything in the pass's query set.
    ///
    /// Locally owned ids and cache hits are filled in immediately. The rest
    /// are grouped by owning shard and pulled asynchronously; the pass
    /// reappears on its receive queue once the last group replies. With no
    /// remote group the pass completes inline, without touching the
    /// in-flight counter.
    pub fn query_remote(self: &Arc<Self>, state: &Arc<SampleState>) {
        assert_eq!(state.pending(), 0, "query_remote with outstanding groups");
        let mut groups: HashMap<Rank, Vec<NodeId>> = HashMap::new();
        {
            let mut inner = state.lock();
            let ids: Vec<NodeId> = inner.query.drain().collect();
            let mut cache = self.cache.lock();
            self.stats.record_total(ids.len() as u64);
            for id in ids {
                if self.store.is_local(id) {
                    let node = self
                        .store
                        .node(id)
                        .expect("locally owned id must resolve")
                        .clone();
                    inner.recv.insert(id, node);
                    continue;
                }
                self.stats.record_nonlocal(1);
                if let Some(hit) = cache.as_mut().and_then(|c| c.lookup(&id)) {
                    inner.recv.insert(id, hit);
                    continue;
                }
                self.stats.record_cache_miss(1);
                // Placeholder slot so concurrent group callbacks never race
                // on map growth for this id.
                inner.recv.insert(id, NodeData::default());
                inner.remote_ids.push(id);
                groups.entry(self.store.meta.owner_of(id)).or_default().push(id);
            }
        }

        if groups.is_empty() {
            let (queue, _) = self.channel(state.tag);
            queue.push(Incoming::State(state.clone()));
            return;
        }

        let (_, in_flight) = self.channel(state.tag);
        in_flight.fetch_add(1, Ordering::AcqRel);
        state.begin_dispatch(groups.len());
        for (rank, keys) in groups {
            let this = self.clone();
            let pass = state.clone();
            let group_keys = keys.clone();
            self.transport.node_pull(
                rank,
                NodePullRequest { keys },
                Box::new(move |response| this.on_partial(pass, group_keys, response)),
            );
        }
    }

    /// Apply one shard's reply and, if it was the last outstanding group,
    /// run the completion path: fill the cache and requeue the pass.
    fn on_partial(&self, state: Arc<SampleState>, keys: Vec<NodeId>, response: NodePullResponse) {
        self.apply_partial(&state, &keys, response);
        if !state.complete_one() {
            return;
        }
        {
            let mut inner = state.lock();
            let remote_ids = std::mem::take(&mut inner.remote_ids);
            let mut cache = self.cache.lock();
            if let Some(cache) = cache.as_mut() {
                for id in remote_ids {
                    if let Some(node) = inner.recv.get(&id) {
                        cache.insert(id, node.clone());
                    }
                }
            }
        }
        let (queue, in_flight) = self.channel(state.tag);
        in_flight.fetch_sub(1, Ordering::AcqRel);
        queue.push(Incoming::State(state));
    }

    /// Slice one group's flat reply buffers into per-node records.
    ///
    /// A malformed reply means the peers disagree on the protocol and this
    /// process cannot keep serving correct data. Runs on a transport thread,
    /// where an unwind would only kill the one worker and leave the pass's
    /// completion counter stranded, so the whole process terminates instead.
    fn apply_partial(&self, state: &Arc<SampleState>, keys: &[NodeId], resp: NodePullResponse) {
        let (f_len, i_len) = (self.store.meta.f_len, self.store.meta.i_len);
        if let Err(msg) = check_reply(&resp, keys.len(), f_len, i_len) {
            tracing::error!(%msg, "malformed node-pull reply");
            std::process::abort();
        }

        let mut inner = state.lock();
        for (i, id) in keys.iter().enumerate() {
            let node = inner
                .recv
                .get_mut(id)
                .expect("placeholder slot created at dispatch");
            node.f_feat = resp.f_feat[i * f_len..(i + 1) * f_len].to_vec();
            node.i_feat = resp.i_feat[i * i_len..(i + 1) * i_len].to_vec();
            node.edge = resp.edge[resp.offset[i]..resp.offset[i + 1]].to_vec();
        }
    }

    /// Passes of `tag` with outstanding remote work.
    pub fn in_flight(&self, tag: Tag) -> usize {
        self.channel(tag).1.load(Ordering::Acquire)
    }

    /// Completed passes waiting to be picked up for `tag`.
    pub fn queued(&self, tag: Tag) -> usize {
        self.channel(tag).0.len()
    }

    pub fn profile(&self) -> FetchSnapshot {
        self.stats.snapshot()
    }
}

/// Validate one shard's reply shape against the request it answers.
fn check_reply(
    resp: &NodePullResponse,
    n: usize,
    f_len: usize,
    i_len: usize,
) -> std::result::Result<(), String> {
    if resp.offset.len() != n + 1 {
        return Err(format!(
            "offset table has {} entries for {n} keys",
            resp.offset.len()
        ));
    }
    if resp.offset.windows(2).any(|w| w[0] > w[1]) {
        return Err("offset table is not monotonic".into());
    }
    if resp.offset[n] != resp.edge.len() {
        return Err(format!(
            "offset table ends at {} but the edge buffer holds {}",
            resp.offset[n],
            resp.edge.len()
        ));
    }
    if resp.f_feat.len() != n * f_len {
        return Err(format!(
            "float feature buffer has {} values, want {n} x {f_len}",
            resp.f_feat.len()
        ));
    }
    if resp.i_feat.len() != n * i_len {
        return Err(format!(
            "int feature buffer has {} values, want {n} x {i_len}",
            resp.i_feat.len()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_reply() -> NodePullResponse {
        NodePullResponse {
            f_feat: vec![0.0; 4],
            i_feat: vec![0; 2],
            edge: vec![1, 2, 3],
            offset: vec![0, 2, 3],
        }
    }

    #[test]
    fn well_formed_reply_passes() {
        assert!(check_reply(&good_reply(), 2, 2, 1).is_ok());
    }

    #[test]
    fn malformed_replies_are_rejected() {
        let mut r = good_reply();
        r.offset = vec![0, 2];
        assert!(check_reply(&r, 2, 2, 1).is_err(), "short offset table");

        let mut r = good_reply();
        r.offset = vec![0, 2, 5];
        assert!(check_reply(&r, 2, 2, 1).is_err(), "offset past edge buffer");

        let mut r = good_reply();
        r.offset = vec![0, 3, 2];
        assert!(check_reply(&r, 2, 2, 1).is_err(), "non-monotonic offsets");

        let mut r = good_reply();
        r.f_feat.pop();
        assert!(check_reply(&r, 2, 2, 1).is_err(), "truncated float features");

        let mut r = good_reply();
        r.i_feat.push(0);
        assert!(check_reply(&r, 2, 2, 1).is_err(), "oversized int features");
    }
}
