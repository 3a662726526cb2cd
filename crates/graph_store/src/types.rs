//! Core data model: node records, shard metadata, and sampled minibatches.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Global node identifier, unique across all shards.
pub type NodeId = i64;

/// Shard rank. Shard `r` owns the contiguous id range
/// `[offset[r], offset[r + 1])` of the global node space.
pub type Rank = usize;

/// Identifier for one registered sampler / output-queue pair.
pub type Tag = u64;

/// Sentinel tag returned by a minibatch pull that named no registered tag.
pub const INVALID_TAG: Tag = Tag::MAX;

/// One node's local data: fixed-length feature rows plus its out-neighbors.
///
/// Feature values are immutable after bulk load; the neighbor list only grows
/// during load and is frozen once the shard starts serving.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeData {
    pub f_feat: Vec<f32>,
    pub i_feat: Vec<i32>,
    pub edge: Vec<NodeId>,
}

/// Node-id keyed collection of fetched node data.
pub type NodePack = HashMap<NodeId, NodeData>;

/// Which sampling algorithm produced a minibatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplerKind {
    LocalNode,
    GlobalNode,
    RandomWalk,
    GraphSage,
    /// Sentinel kind for a minibatch pull that resolved no registered tag.
    Invalid,
}

impl SamplerKind {
    /// Default tag assigned when the caller registers a sampler without one.
    pub fn default_tag(self) -> Tag {
        match self {
            SamplerKind::LocalNode => 0,
            SamplerKind::GlobalNode => 1,
            SamplerKind::RandomWalk => 2,
            SamplerKind::GraphSage => 3,
            SamplerKind::Invalid => INVALID_TAG,
        }
    }
}

/// One self-contained sampled subgraph, ready for a learning consumer.
///
/// `coo_u[k] -> coo_v[k]` reference the dense local row indices of the
/// feature matrices, not global node ids. `extra` is an optional auxiliary
/// array (the GraphSage core-node mask); empty for other samplers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphMiniBatch {
    pub f_feat: Vec<f32>,
    pub i_feat: Vec<i32>,
    pub coo_u: Vec<NodeId>,
    pub coo_v: Vec<NodeId>,
    pub extra: Vec<i32>,
    pub tag: Tag,
    pub kind: SamplerKind,
}

/// The default minibatch is the sentinel reply: no rows, no edges, and a
/// tag/kind pair no sampler can register.
impl Default for GraphMiniBatch {
    fn default() -> Self {
        Self {
            f_feat: Vec::new(),
            i_feat: Vec::new(),
            coo_u: Vec::new(),
            coo_v: Vec::new(),
            extra: Vec::new(),
            tag: INVALID_TAG,
            kind: SamplerKind::Invalid,
        }
    }
}

/// Global partition metadata shared by every shard and worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardMeta {
    /// This shard's rank.
    pub rank: Rank,
    /// Total number of shards.
    pub nrank: usize,
    /// Float feature length, identical for every node.
    pub f_len: usize,
    /// Int feature length, identical for every node.
    pub i_len: usize,
    /// Total node count across all shards.
    pub num_nodes: usize,
    /// Per-shard node-id offsets; `offset[r]..offset[r + 1]` is shard r's
    /// range and `offset[nrank] == num_nodes`.
    pub offset: Vec<NodeId>,
}

impl ShardMeta {
    /// Validate the offset table invariants.
    pub fn validate(&self) -> Result<()> {
        if self.offset.len() != self.nrank + 1 {
            return Err(GraphError::BadOffsets(format!(
                "expected {} entries, got {}",
                self.nrank + 1,
                self.offset.len()
            )));
        }
        if self.offset.windows(2).any(|w| w[0] > w[1]) {
            return Err(GraphError::BadOffsets("offsets are not monotonic".into()));
        }
        if *self.offset.last().unwrap_or(&-1) != self.num_nodes as NodeId {
            return Err(GraphError::BadOffsets(format!(
                "offset[last] = {:?} != num_nodes = {}",
                self.offset.last(),
                self.num_nodes
            )));
        }
        if self.rank >= self.nrank {
            return Err(GraphError::BadOffsets(format!(
                "rank {} out of range for {} shards",
                self.rank, self.nrank
            )));
        }
        Ok(())
    }

    /// Rank of the shard owning `id`: the smallest `r` with
    /// `id < offset[r + 1]`.
    pub fn owner_of(&self, id: NodeId) -> Rank {
        self.offset[1..].partition_point(|&end| id >= end)
    }

    /// First node id owned by this shard.
    pub fn local_offset(&self) -> NodeId {
        self.offset[self.rank]
    }

    /// Number of nodes owned by this shard.
    pub fn local_nodes(&self) -> usize {
        (self.offset[self.rank + 1] - self.offset[self.rank]) as usize
    }
}

/// This shard's slice of the graph: node records indexed by local offset.
///
/// Read-only after bulk load, so it is shared freely across sampler threads
/// and transport callbacks without synchronization.
pub struct ShardStore {
    pub meta: ShardMeta,
    nodes: Vec<NodeData>,
}

impl ShardStore {
    pub fn new(meta: ShardMeta, nodes: Vec<NodeData>) -> Result<Self> {
        if nodes.len() != meta.local_nodes() {
            return Err(GraphError::ShapeMismatch(format!(
                "{} node records for a shard owning {} nodes",
                nodes.len(),
                meta.local_nodes()
            )));
        }
        Ok(Self { meta, nodes })
    }

    pub fn is_local(&self, id: NodeId) -> bool {
        id >= self.meta.local_offset()
            && id < self.meta.local_offset() + self.nodes.len() as NodeId
    }

    /// Record for a locally owned global id.
    pub fn node(&self, id: NodeId) -> Result<&NodeData> {
        if !self.is_local(id) {
            return Err(GraphError::NotLocal {
                id,
                rank: self.meta.rank,
            });
        }
        Ok(&self.nodes[(id - self.meta.local_offset()) as usize])
    }

    /// Record by local row index.
    pub fn node_at(&self, local_index: usize) -> &NodeData {
        &self.nodes[local_index]
    }

    pub fn local_nodes(&self) -> usize {
        self.nodes.len()
    }
}
