//! Shared helpers for integration tests: an in-process multi-shard cluster
//! over the local transport, loaded with a deterministic ring graph.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::time::{Duration, Instant};

use graph_store::transport::Transport;
use graph_store::types::{NodeId, ShardMeta};
use graph_store::{GraphHandle, LocalTransport, ServerConfig};

static LOG_INIT: Once = Once::new();

/// Honor `RUST_LOG` in test runs; quiet by default.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub const F_LEN: usize = 2;
pub const I_LEN: usize = 1;

/// Deadline for waiting on background sampler progress.
pub const WAIT: Duration = Duration::from_secs(10);

/// Deterministic float features for node `id`: `[id, 2 * id]`.
pub fn f_feat_of(id: NodeId) -> Vec<f32> {
    vec![id as f32, (2 * id) as f32]
}

/// Deterministic int feature for node `id`: `[id % 2]`.
pub fn i_feat_of(id: NodeId) -> Vec<i32> {
    vec![(id % 2) as i32]
}

/// Ring neighbors of `id` in a graph of `num_nodes`.
pub fn neighbors_of(id: NodeId, num_nodes: usize) -> Vec<NodeId> {
    let n = num_nodes as NodeId;
    vec![(id + 1) % n, (id + n - 1) % n]
}

pub struct TestCluster {
    pub transport: Arc<LocalTransport>,
    pub handles: Vec<Arc<GraphHandle>>,
    pub num_nodes: usize,
}

impl TestCluster {
    pub fn handle(&self, rank: usize) -> &Arc<GraphHandle> {
        &self.handles[rank]
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.stop_sampling();
        }
        self.transport.shutdown();
    }
}

/// Build `nrank` shards, each owning `nodes_per_shard` nodes of a ring
/// graph, wired together over one in-process transport.
pub fn build_cluster(nrank: usize, nodes_per_shard: usize, config: ServerConfig) -> TestCluster {
    init_logging();
    let num_nodes = nrank * nodes_per_shard;
    let offset: Vec<NodeId> = (0..=nrank).map(|r| (r * nodes_per_shard) as NodeId).collect();
    let transport = LocalTransport::new(config.transport_workers, 128);

    let mut handles = Vec::with_capacity(nrank);
    for rank in 0..nrank {
        let meta = ShardMeta {
            rank,
            nrank,
            f_len: F_LEN,
            i_len: I_LEN,
            num_nodes,
            offset: offset.clone(),
        };
        let boxed: Arc<dyn Transport> = transport.clone();
        let handle = GraphHandle::new(config, boxed);
        handle.init_meta(meta).expect("valid meta");

        let ids = (offset[rank]..offset[rank + 1]).collect::<Vec<_>>();
        let f_feat: Vec<f32> = ids.iter().flat_map(|&id| f_feat_of(id)).collect();
        let i_feat: Vec<i32> = ids.iter().flat_map(|&id| i_feat_of(id)).collect();
        let edges: Vec<(NodeId, NodeId)> = ids
            .iter()
            .flat_map(|&id| {
                neighbors_of(id, num_nodes)
                    .into_iter()
                    .map(move |v| (id, v))
            })
            .collect();
        handle
            .init_data(&f_feat, &i_feat, &edges)
            .expect("valid bulk load");
        transport.register(rank, &handle);
        handles.push(handle);
    }

    TestCluster {
        transport,
        handles,
        num_nodes,
    }
}

/// Poll `cond` until it holds or the deadline passes.
pub fn wait_until(cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < WAIT, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(2));
    }
}
