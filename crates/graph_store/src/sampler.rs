//! Background sampling algorithms.
//!
//! Each registered sampler owns one OS thread running a pull-driven loop:
//! take a sampling pass from the coordinator, advance it one round, and
//! either send it back out for a remote fetch or finish it into a minibatch
//! on the tag's output queue. Cancellation is cooperative: the kill flag is
//! only observed at round boundaries, so an in-flight remote round always
//! completes and never leaks the in-flight counter.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::queue::BoundedQueue;
use crate::random::IndexSelecter;
use crate::remote::RemoteFetchCoordinator;
use crate::state::{Frontier, SampleState};
use crate::types::{GraphMiniBatch, NodeId, NodePack, SamplerKind, ShardStore, Tag};

/// What `step` decided about a pass.
pub enum StepOutcome {
    /// The pass filled its query set and needs a fetch round.
    NeedsFetch,
    /// The pass is done; the state has been consumed.
    Finished(GraphMiniBatch),
}

/// One step of a (possibly multi-round) sampling algorithm.
pub trait Sampler: Send + 'static {
    fn kind(&self) -> SamplerKind;
    fn step(&mut self, state: &Arc<SampleState>) -> StepOutcome;
}

/// A running sampler thread and its kill flag.
pub(crate) struct SamplerRunner {
    pub tag: Tag,
    pub kill: Arc<AtomicBool>,
    pub thread: JoinHandle<()>,
}

pub(crate) fn spawn_sampler(
    mut sampler: Box<dyn Sampler>,
    tag: Tag,
    coordinator: Arc<RemoteFetchCoordinator>,
    output: Arc<BoundedQueue<GraphMiniBatch>>,
) -> SamplerRunner {
    let kill = Arc::new(AtomicBool::new(false));
    let flag = kill.clone();
    let kind = sampler.kind();
    let thread = std::thread::Builder::new()
        .name(format!("sampler-{tag}"))
        .spawn(move || {
            loop {
                if flag.load(Ordering::Acquire) {
                    break;
                }
                let Some(state) = coordinator.get_sample_state(tag, kind) else {
                    break;
                };
                // A kill while blocked above leaves the pass unconsumed; its
                // remote round already completed, nothing leaks.
                if flag.load(Ordering::Acquire) {
                    break;
                }
                debug_assert_eq!(state.tag, tag, "pass from a foreign tag");
                match sampler.step(&state) {
                    StepOutcome::NeedsFetch => coordinator.query_remote(&state),
                    StepOutcome::Finished(batch) => output.push(batch),
                }
            }
            tracing::debug!(tag, ?kind, "sampler thread exiting");
        })
        .expect("spawn sampler thread");
    SamplerRunner { tag, kill, thread }
}

/// Assemble a minibatch from a finished node pack: dense row indices in
/// iteration order, features concatenated row-wise, and every edge whose
/// both endpoints made it into the batch, remapped to row indices.
pub(crate) fn construct(
    pack: &NodePack,
    tag: Tag,
    kind: SamplerKind,
    f_len: usize,
    i_len: usize,
) -> GraphMiniBatch {
    let mut index = std::collections::HashMap::with_capacity(pack.len());
    let mut f_feat = Vec::with_capacity(pack.len() * f_len);
    let mut i_feat = Vec::with_capacity(pack.len() * i_len);
    for (row, (&id, node)) in pack.iter().enumerate() {
        index.insert(id, row as NodeId);
        f_feat.extend_from_slice(&node.f_feat);
        i_feat.extend_from_slice(&node.i_feat);
    }
    let mut coo_u = Vec::new();
    let mut coo_v = Vec::new();
    for (&id, node) in pack.iter() {
        let u = index[&id];
        for v in &node.edge {
            if let Some(&dst) = index.get(v) {
                coo_u.push(u);
                coo_v.push(dst);
            }
        }
    }
    GraphMiniBatch {
        f_feat,
        i_feat,
        coo_u,
        coo_v,
        extra: Vec::new(),
        tag,
        kind,
    }
}

// ---------------------------------------------------------------- local

/// Single-shot sampler over locally owned nodes; never touches the network.
pub struct LocalNodeSampler {
    store: Arc<ShardStore>,
    rd: IndexSelecter,
    batch_size: usize,
}

impl LocalNodeSampler {
    pub fn new(store: Arc<ShardStore>, batch_size: usize) -> Self {
        Self {
            store,
            rd: IndexSelecter::new(),
            batch_size,
        }
    }
}

impl Sampler for LocalNodeSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::LocalNode
    }

    fn step(&mut self, state: &Arc<SampleState>) -> StepOutcome {
        let rows = self
            .rd
            .unique(self.batch_size, self.store.local_nodes())
            .expect("batch size validated at registration");
        let offset = self.store.meta.local_offset();
        let mut pack = NodePack::with_capacity(rows.len());
        for row in rows {
            pack.insert(offset + row as NodeId, self.store.node_at(row).clone());
        }
        let meta = &self.store.meta;
        StepOutcome::Finished(construct(&pack, state.tag, self.kind(), meta.f_len, meta.i_len))
    }
}

// ---------------------------------------------------------------- global

/// Uniform sampler over the whole node space; one fetch round, then done.
pub struct GlobalNodeSampler {
    store: Arc<ShardStore>,
    rd: IndexSelecter,
    batch_size: usize,
}

impl GlobalNodeSampler {
    pub fn new(store: Arc<ShardStore>, batch_size: usize) -> Self {
        Self {
            store,
            rd: IndexSelecter::new(),
            batch_size,
        }
    }
}

impl Sampler for GlobalNodeSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::GlobalNode
    }

    fn step(&mut self, state: &Arc<SampleState>) -> StepOutcome {
        let meta = &self.store.meta;
        let mut inner = state.lock();
        if inner.recv.is_empty() {
            let ids = self
                .rd
                .unique(self.batch_size, meta.num_nodes)
                .expect("batch size validated at registration");
            inner.query = ids.into_iter().map(|i| i as NodeId).collect();
            return StepOutcome::NeedsFetch;
        }
        StepOutcome::Finished(construct(
            &inner.recv,
            state.tag,
            self.kind(),
            meta.f_len,
            meta.i_len,
        ))
    }
}

// ---------------------------------------------------------------- walk

/// Uniform random walk: seed `head_count` local start nodes, then advance
/// every head along one uniformly chosen neighbor edge per round.
pub struct RandomWalkSampler {
    store: Arc<ShardStore>,
    rd: IndexSelecter,
    head_count: usize,
    length: usize,
}

impl RandomWalkSampler {
    pub fn new(store: Arc<ShardStore>, head_count: usize, length: usize) -> Self {
        Self {
            store,
            rd: IndexSelecter::new(),
            head_count,
            length,
        }
    }
}

impl Sampler for RandomWalkSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::RandomWalk
    }

    fn step(&mut self, state: &Arc<SampleState>) -> StepOutcome {
        let meta = self.store.meta.clone();
        let mut inner = state.lock();

        let (mut heads, round) = match &mut inner.frontier {
            Frontier::Walk { frontier, round } => (std::mem::take(frontier), *round),
            _ => unreachable!("walk state carries a walk frontier"),
        };

        if round == 0 {
            // Seed round: the first fetch round of the walk.
            let rows = self
                .rd
                .unique(self.head_count, self.store.local_nodes())
                .expect("head count validated at registration");
            let offset = meta.local_offset();
            heads = rows.into_iter().map(|r| offset + r as NodeId).collect();
            inner.query = heads.iter().copied().collect();
            inner.frontier = Frontier::Walk {
                frontier: heads,
                round: 1,
            };
            return StepOutcome::NeedsFetch;
        }

        if round >= self.length {
            let batch = construct(&inner.recv, state.tag, self.kind(), meta.f_len, meta.i_len);
            return StepOutcome::Finished(batch);
        }

        // Advance every head one uniformly chosen edge. Heads with no
        // neighbors drop out of the walk; that truncation is expected.
        let mut next = Vec::with_capacity(heads.len());
        let mut query = HashSet::new();
        for u in heads.drain(..) {
            let Some(node) = inner.recv.get(&u) else {
                continue;
            };
            if node.edge.is_empty() {
                continue;
            }
            let v = node.edge[self.rd.rand_index(node.edge.len())];
            if !inner.recv.contains_key(&v) {
                query.insert(v);
            }
            next.push(v);
        }
        inner.query = query;
        inner.frontier = Frontier::Walk {
            frontier: next,
            round: round + 1,
        };
        StepOutcome::NeedsFetch
    }
}

// ---------------------------------------------------------------- sage

/// GraphSage-style neighborhood expansion around a core batch drawn from a
/// precomputed training index.
pub struct GraphSageSampler {
    store: Arc<ShardStore>,
    rd: IndexSelecter,
    train_index: Arc<Vec<NodeId>>,
    batch_size: usize,
    depth: usize,
    width: usize,
}

impl GraphSageSampler {
    pub fn new(
        store: Arc<ShardStore>,
        train_index: Arc<Vec<NodeId>>,
        batch_size: usize,
        depth: usize,
        width: usize,
    ) -> Self {
        Self {
            store,
            rd: IndexSelecter::new(),
            train_index,
            batch_size,
            depth,
            width,
        }
    }

    /// Batch assembly with the explicit accumulated edge pairs and the
    /// 0/1 core-membership mask.
    fn construct_expand(
        &self,
        pack: &NodePack,
        core: &HashSet<NodeId>,
        coo: &[(NodeId, NodeId)],
        tag: Tag,
    ) -> GraphMiniBatch {
        let meta = &self.store.meta;
        let mut index = std::collections::HashMap::with_capacity(pack.len());
        let mut f_feat = Vec::with_capacity(pack.len() * meta.f_len);
        let mut i_feat = Vec::with_capacity(pack.len() * meta.i_len);
        let mut extra = Vec::with_capacity(pack.len());
        for (row, (&id, node)) in pack.iter().enumerate() {
            index.insert(id, row as NodeId);
            f_feat.extend_from_slice(&node.f_feat);
            i_feat.extend_from_slice(&node.i_feat);
            extra.push(core.contains(&id) as i32);
        }
        let mut coo_u = Vec::with_capacity(coo.len());
        let mut coo_v = Vec::with_capacity(coo.len());
        for &(u, v) in coo {
            if let (Some(&su), Some(&sv)) = (index.get(&u), index.get(&v)) {
                coo_u.push(su);
                coo_v.push(sv);
            }
        }
        GraphMiniBatch {
            f_feat,
            i_feat,
            coo_u,
            coo_v,
            extra,
            tag,
            kind: SamplerKind::GraphSage,
        }
    }
}

impl Sampler for GraphSageSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::GraphSage
    }

    fn step(&mut self, state: &Arc<SampleState>) -> StepOutcome {
        let mut inner = state.lock();

        let (mut frontier, core, mut coo, round) = match &mut inner.frontier {
            Frontier::Expand {
                frontier,
                core,
                coo,
                round,
            } => (
                std::mem::take(frontier),
                std::mem::take(core),
                std::mem::take(coo),
                *round,
            ),
            _ => unreachable!("expansion state carries an expand frontier"),
        };

        if round == 0 && core.is_empty() {
            let picks = self
                .rd
                .unique(self.batch_size, self.train_index.len())
                .expect("batch size validated against the training index");
            let core: HashSet<NodeId> = picks.into_iter().map(|i| self.train_index[i]).collect();
            inner.query = core.iter().copied().collect();
            inner.frontier = Frontier::Expand {
                frontier: core.iter().copied().collect(),
                core,
                coo,
                round: 0,
            };
            return StepOutcome::NeedsFetch;
        }

        if round >= self.depth {
            let batch = self.construct_expand(&inner.recv, &core, &coo, state.tag);
            return StepOutcome::Finished(batch);
        }

        // Expand: every frontier node samples up to `width` distinct
        // neighbor edges, both directions recorded. Nodes without neighbors
        // are skipped, not failed.
        let mut touched = HashSet::new();
        for u in frontier.drain(..) {
            let Some(node) = inner.recv.get(&u) else {
                continue;
            };
            if node.edge.is_empty() {
                continue;
            }
            let k = self.width.min(node.edge.len());
            let picks = self
                .rd
                .unique(k, node.edge.len())
                .expect("k bounded by degree");
            for p in picks {
                let v = node.edge[p];
                coo.push((u, v));
                coo.push((v, u));
                if !inner.recv.contains_key(&v) {
                    touched.insert(v);
                }
            }
        }
        inner.query = touched.iter().copied().collect();
        inner.frontier = Frontier::Expand {
            frontier: touched.into_iter().collect(),
            core,
            coo,
            round: round + 1,
        };
        StepOutcome::NeedsFetch
    }
}

/// Build the training-node index: every local node, or only those whose int
/// feature at `mask_index` equals one.
pub(crate) fn build_train_index(store: &ShardStore, mask_index: Option<usize>) -> Vec<NodeId> {
    let offset = store.meta.local_offset();
    match mask_index {
        None => (0..store.local_nodes())
            .map(|row| offset + row as NodeId)
            .collect(),
        Some(col) => (0..store.local_nodes())
            .filter(|&row| store.node_at(row).i_feat.get(col) == Some(&1))
            .map(|row| offset + row as NodeId)
            .collect(),
    }
}
