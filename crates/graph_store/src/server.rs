//! The per-shard serving handle.
//!
//! Owns the local node data, the registered samplers and their output
//! queues, and the remote-fetch coordinator. The RPC layer calls into the
//! `serve_*` handlers; everything else is process-local wiring: bulk load,
//! sampler registration, and shutdown.

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::config::ServerConfig;
use crate::error::{GraphError, Result};
use crate::queue::BoundedQueue;
use crate::remote::RemoteFetchCoordinator;
use crate::sampler::{
    build_train_index, spawn_sampler, GlobalNodeSampler, GraphSageSampler, LocalNodeSampler,
    RandomWalkSampler, Sampler, SamplerRunner,
};
use crate::stats::FetchSnapshot;
use crate::transport::{NodePullResponse, Transport};
use crate::types::{
    GraphMiniBatch, NodeData, NodeId, SamplerKind, ShardMeta, ShardStore, Tag, INVALID_TAG,
};

/// Parameters for one sampler registration.
#[derive(Clone, Copy, Debug)]
pub enum SamplerSpec {
    LocalNode {
        batch_size: usize,
    },
    GlobalNode {
        batch_size: usize,
    },
    RandomWalk {
        head_count: usize,
        length: usize,
    },
    GraphSage {
        batch_size: usize,
        depth: usize,
        width: usize,
        train_mask_index: Option<usize>,
    },
}

impl SamplerSpec {
    pub fn kind(&self) -> SamplerKind {
        match self {
            SamplerSpec::LocalNode { .. } => SamplerKind::LocalNode,
            SamplerSpec::GlobalNode { .. } => SamplerKind::GlobalNode,
            SamplerSpec::RandomWalk { .. } => SamplerKind::RandomWalk,
            SamplerSpec::GraphSage { .. } => SamplerKind::GraphSage,
        }
    }
}

/// Reply to a minibatch pull.
#[derive(Clone, Debug)]
pub struct GraphPullReply {
    pub batch: GraphMiniBatch,
}

impl GraphPullReply {
    /// Sentinel reply for a pull naming no registered tag.
    fn invalid() -> Self {
        Self {
            batch: GraphMiniBatch::default(),
        }
    }
}

/// NotReady/Ready gate; serve handlers wait here before touching shard data.
#[derive(Default)]
struct ReadyGate {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl ReadyGate {
    fn set(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut ready = self.ready.lock();
        while !*ready {
            self.cv.wait(&mut ready);
        }
    }

    fn is_set(&self) -> bool {
        *self.ready.lock()
    }
}

pub struct GraphHandle {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    meta: OnceLock<ShardMeta>,
    store: OnceLock<Arc<ShardStore>>,
    remote: OnceLock<Arc<RemoteFetchCoordinator>>,
    /// One bounded output queue per registered tag.
    graph_queues: DashMap<Tag, Arc<BoundedQueue<GraphMiniBatch>>>,
    /// Tags in registration order; the default preference list.
    tag_order: Mutex<Vec<Tag>>,
    samplers: Mutex<Vec<SamplerRunner>>,
    /// GraphSage training index, built at most once per handle.
    train_index: OnceLock<Arc<Vec<NodeId>>>,
    ready: ReadyGate,
}

impl GraphHandle {
    pub fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            meta: OnceLock::new(),
            store: OnceLock::new(),
            remote: OnceLock::new(),
            graph_queues: DashMap::new(),
            tag_order: Mutex::new(Vec::new()),
            samplers: Mutex::new(Vec::new()),
            train_index: OnceLock::new(),
            ready: ReadyGate::default(),
        })
    }

    /// One-time partition metadata load.
    pub fn init_meta(&self, meta: ShardMeta) -> Result<()> {
        meta.validate()?;
        self.meta
            .set(meta)
            .map_err(|_| GraphError::AlreadyServing)?;
        Ok(())
    }

    /// One-time bulk load of this shard's node range.
    ///
    /// `f_feat` and `i_feat` are row-major `[local_nodes x f_len]` /
    /// `[local_nodes x i_len]` matrices; `edges` are (src, dst) pairs whose
    /// sources must all be locally owned. Marks the handle ready on success.
    pub fn init_data(
        &self,
        f_feat: &[f32],
        i_feat: &[i32],
        edges: &[(NodeId, NodeId)],
    ) -> Result<()> {
        let meta = self
            .meta
            .get()
            .ok_or(GraphError::NotInitialized("init_meta must run first"))?
            .clone();
        if self.ready.is_set() {
            return Err(GraphError::AlreadyServing);
        }
        if self.config.recv_queue_capacity <= self.config.server_buffer_size {
            return Err(GraphError::BadConfig(format!(
                "recv_queue_capacity {} must exceed server_buffer_size {}",
                self.config.recv_queue_capacity, self.config.server_buffer_size
            )));
        }
        let n = meta.local_nodes();
        if f_feat.len() != n * meta.f_len {
            return Err(GraphError::ShapeMismatch(format!(
                "float features: got {} values, want {} x {}",
                f_feat.len(),
                n,
                meta.f_len
            )));
        }
        if i_feat.len() != n * meta.i_len {
            return Err(GraphError::ShapeMismatch(format!(
                "int features: got {} values, want {} x {}",
                i_feat.len(),
                n,
                meta.i_len
            )));
        }
        let offset = meta.local_offset();
        let mut nodes: Vec<NodeData> = (0..n)
            .map(|row| NodeData {
                f_feat: f_feat[row * meta.f_len..(row + 1) * meta.f_len].to_vec(),
                i_feat: i_feat[row * meta.i_len..(row + 1) * meta.i_len].to_vec(),
                edge: Vec::new(),
            })
            .collect();
        for &(u, v) in edges {
            if u < offset || u >= offset + n as NodeId {
                return Err(GraphError::NotLocal { id: u, rank: meta.rank });
            }
            // Every destination must resolve to a real shard at fetch time.
            if v < 0 || v >= meta.num_nodes as NodeId {
                return Err(GraphError::ShapeMismatch(format!(
                    "edge ({u}, {v}) points outside the node space of {}",
                    meta.num_nodes
                )));
            }
            nodes[(u - offset) as usize].edge.push(v);
        }

        let store = Arc::new(ShardStore::new(meta, nodes)?);
        self.store
            .set(store.clone())
            .map_err(|_| GraphError::AlreadyServing)?;
        let remote = RemoteFetchCoordinator::new(
            store,
            self.transport.clone(),
            self.config.server_buffer_size,
            self.config.recv_queue_capacity,
        );
        if self.config.cache_capacity > 0 {
            remote.init_cache(self.config.cache_capacity, self.config.cache_policy)?;
        }
        self.remote
            .set(remote)
            .map_err(|_| GraphError::AlreadyServing)?;
        self.ready.set();
        tracing::info!(
            rank = self.meta.get().map(|m| m.rank),
            nodes = n,
            "shard data loaded, handle ready"
        );
        Ok(())
    }

    fn store(&self) -> Result<&Arc<ShardStore>> {
        self.store
            .get()
            .ok_or(GraphError::NotInitialized("data not loaded"))
    }

    /// Coordinator accessor, for tests and profiling.
    pub fn remote(&self) -> Result<&Arc<RemoteFetchCoordinator>> {
        self.remote
            .get()
            .ok_or(GraphError::NotInitialized("data not loaded"))
    }

    /// Register a sampler under `tag` (or its kind's default tag) and start
    /// its background thread.
    pub fn add_sampler(&self, spec: SamplerSpec, tag: Option<Tag>) -> Result<Tag> {
        let store = self.store()?.clone();
        let remote = self.remote()?.clone();
        let tag = tag.unwrap_or_else(|| spec.kind().default_tag());
        if tag == INVALID_TAG {
            return Err(GraphError::InvalidSampler("reserved tag".into()));
        }

        let sampler: Box<dyn Sampler> = match spec {
            SamplerSpec::LocalNode { batch_size } => {
                if batch_size == 0 || batch_size > store.local_nodes() {
                    return Err(GraphError::InvalidSampler(format!(
                        "local batch size {batch_size} vs {} local nodes",
                        store.local_nodes()
                    )));
                }
                Box::new(LocalNodeSampler::new(store, batch_size))
            }
            SamplerSpec::GlobalNode { batch_size } => {
                if batch_size == 0 || batch_size > store.meta.num_nodes {
                    return Err(GraphError::InvalidSampler(format!(
                        "global batch size {batch_size} vs {} nodes",
                        store.meta.num_nodes
                    )));
                }
                Box::new(GlobalNodeSampler::new(store, batch_size))
            }
            SamplerSpec::RandomWalk { head_count, length } => {
                if head_count == 0 || head_count > store.local_nodes() || length == 0 {
                    return Err(GraphError::InvalidSampler(format!(
                        "walk with {head_count} heads, length {length}"
                    )));
                }
                Box::new(RandomWalkSampler::new(store, head_count, length))
            }
            SamplerSpec::GraphSage {
                batch_size,
                depth,
                width,
                train_mask_index,
            } => {
                if batch_size == 0 || depth == 0 || width == 0 {
                    return Err(GraphError::InvalidSampler(format!(
                        "expansion with batch {batch_size}, depth {depth}, width {width}"
                    )));
                }
                let index = self
                    .train_index
                    .get_or_init(|| Arc::new(build_train_index(&store, train_mask_index)))
                    .clone();
                if index.len() < batch_size {
                    return Err(GraphError::InsufficientTrainNodes {
                        have: index.len(),
                        need: batch_size,
                    });
                }
                Box::new(GraphSageSampler::new(store, index, batch_size, depth, width))
            }
        };

        let queue = Arc::new(BoundedQueue::new(self.config.graph_queue_capacity));
        match self.graph_queues.entry(tag) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(GraphError::DuplicateTag(tag));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(queue.clone());
            }
        }
        self.tag_order.lock().push(tag);
        remote.register_tag(tag);
        let runner = spawn_sampler(sampler, tag, remote, queue);
        self.samplers.lock().push(runner);
        tracing::info!(tag, kind = ?spec.kind(), "sampler registered");
        Ok(tag)
    }

    /// Stop every sampler and leave all output queues empty.
    ///
    /// Kill flags only take effect at round boundaries; queues are drained
    /// in a loop so a sampler blocked mid-push gets released, and the
    /// receive queues are poisoned so one blocked waiting for a pass wakes
    /// up. Output queues end up closed, so a minibatch pull blocked on an
    /// empty queue returns the sentinel reply. Must run before the serving
    /// process exits.
    pub fn stop_sampling(&self) {
        let runners = std::mem::take(&mut *self.samplers.lock());
        if runners.is_empty() {
            return;
        }
        for runner in &runners {
            runner.kill.store(true, Ordering::Release);
        }
        if let Ok(remote) = self.remote() {
            for runner in &runners {
                remote.shutdown_tag(runner.tag);
            }
        }
        loop {
            for queue in self.graph_queues.iter() {
                queue.value().drain();
            }
            if runners.iter().all(|r| r.thread.is_finished()) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        for runner in runners {
            if let Err(err) = runner.thread.join() {
                tracing::error!(tag = runner.tag, ?err, "sampler thread panicked");
            }
        }
        // Threads are gone; close the queues so a pull blocked on one wakes
        // with the sentinel, then sweep anything pushed after the last drain.
        for queue in self.graph_queues.iter() {
            queue.value().close();
            queue.value().drain();
        }
        tracing::info!("sampling stopped, output queues drained");
    }

    // ------------------------------------------------- serve handlers

    /// Point pull: features, concatenated neighbor lists, and per-node
    /// offsets for a list of locally owned ids.
    pub fn serve_node_pull(&self, keys: &[NodeId]) -> Result<NodePullResponse> {
        self.ready.wait();
        let store = self.store()?;
        let meta = &store.meta;
        let n = keys.len();
        let mut offset = Vec::with_capacity(n + 1);
        let mut total = 0usize;
        offset.push(total);
        for &key in keys {
            let node = store.node(key)?;
            total += node.edge.len();
            offset.push(total);
        }
        let mut f_feat = Vec::with_capacity(n * meta.f_len);
        let mut i_feat = Vec::with_capacity(n * meta.i_len);
        let mut edge = Vec::with_capacity(total);
        for &key in keys {
            let node = store.node(key)?;
            f_feat.extend_from_slice(&node.f_feat);
            i_feat.extend_from_slice(&node.i_feat);
            edge.extend_from_slice(&node.edge);
        }
        Ok(NodePullResponse {
            f_feat,
            i_feat,
            edge,
            offset,
        })
    }

    /// Minibatch pull with an ordered tag preference list.
    ///
    /// Tries each preferred tag's queue without blocking and blocks on the
    /// last one if nothing was immediately available. An empty preference
    /// list means "any registered tag". Naming no registered tag yields the
    /// sentinel reply instead of blocking forever.
    pub fn serve_graph_pull(&self, preference: &[Tag]) -> GraphPullReply {
        self.ready.wait();
        let prefs: Vec<Tag> = if preference.is_empty() {
            self.tag_order.lock().clone()
        } else {
            preference
                .iter()
                .copied()
                .filter(|t| self.graph_queues.contains_key(t))
                .collect()
        };
        let Some((&last, rest)) = prefs.split_last() else {
            return GraphPullReply::invalid();
        };
        for &tag in rest {
            if let Some(queue) = self.graph_queues.get(&tag) {
                if let Some(batch) = queue.try_pop() {
                    return GraphPullReply { batch };
                }
            }
        }
        let queue = match self.graph_queues.get(&last) {
            Some(queue) => queue.value().clone(),
            None => return GraphPullReply::invalid(),
        };
        if let Some(batch) = queue.try_pop() {
            return GraphPullReply { batch };
        }
        match queue.pop() {
            Some(batch) => GraphPullReply { batch },
            // Queue closed by shutdown while we were blocked.
            None => GraphPullReply::invalid(),
        }
    }

    /// Serialized shard metadata for worker bootstrap.
    pub fn serve_meta_pull(&self) -> Result<String> {
        self.ready.wait();
        let meta = self
            .meta
            .get()
            .ok_or(GraphError::NotInitialized("meta not loaded"))?;
        serde_json::to_string(meta)
            .map_err(|e| GraphError::ShapeMismatch(format!("meta serialization: {e}")))
    }

    /// (cache misses, non-local fetches, total fetches) profiling counters.
    pub fn profile(&self) -> Result<FetchSnapshot> {
        Ok(self.remote()?.profile())
    }

    /// Minibatches currently queued for `tag`.
    pub fn queued_batches(&self, tag: Tag) -> Option<usize> {
        self.graph_queues.get(&tag).map(|q| q.len())
    }

    /// Sampler threads not yet stopped.
    pub fn active_samplers(&self) -> usize {
        self.samplers.lock().len()
    }
}

impl Drop for GraphHandle {
    fn drop(&mut self) {
        // Idempotent; a handle dropped without an explicit stop still joins
        // its sampler threads.
        self.stop_sampling();
    }
}
