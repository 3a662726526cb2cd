//! Remote-fetch coordinator: classification, fan-out, exactly-once
//! completion, and backpressure.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use common::{build_cluster, f_feat_of, i_feat_of, neighbors_of, wait_until};
use graph_store::state::SampleState;
use graph_store::transport::{NodePullRequest, NodePullResponse, PullCallback, Transport};
use graph_store::types::{NodeId, Rank, ShardMeta};
use graph_store::{GraphHandle, Policy, SamplerKind, SamplerSpec, ServerConfig, INVALID_TAG};

const TAG: u64 = 7;

/// Transport stub that parks every request until the test releases it.
#[derive(Default)]
struct FakeTransport {
    pending: Mutex<Vec<(Rank, Vec<NodeId>, PullCallback)>>,
}

impl FakeTransport {
    fn take(&self) -> Vec<(Rank, Vec<NodeId>, PullCallback)> {
        std::mem::take(&mut self.pending.lock())
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Transport for FakeTransport {
    fn node_pull(&self, target: Rank, request: NodePullRequest, callback: PullCallback) {
        self.pending.lock().push((target, request.keys, callback));
    }
}

/// Synthesize the reply a remote shard would send for `keys`.
fn reply_for(keys: &[NodeId], num_nodes: usize) -> NodePullResponse {
    let mut f_feat = Vec::new();
    let mut i_feat = Vec::new();
    let mut edge = Vec::new();
    let mut offset = vec![0usize];
    for &id in keys {
        f_feat.extend(f_feat_of(id));
        i_feat.extend(i_feat_of(id));
        let nbrs = neighbors_of(id, num_nodes);
        edge.extend_from_slice(&nbrs);
        offset.push(edge.len());
    }
    NodePullResponse {
        f_feat,
        i_feat,
        edge,
        offset,
    }
}

/// A shard-0 handle over a fake transport: 4 ranks, 4 nodes each.
fn fake_shard(config: ServerConfig) -> (Arc<GraphHandle>, Arc<FakeTransport>, usize) {
    let num_nodes = 16;
    let meta = ShardMeta {
        rank: 0,
        nrank: 4,
        f_len: common::F_LEN,
        i_len: common::I_LEN,
        num_nodes,
        offset: vec![0, 4, 8, 12, 16],
    };
    let transport = Arc::new(FakeTransport::default());
    let handle = GraphHandle::new(config, transport.clone());
    handle.init_meta(meta).unwrap();
    let ids: Vec<NodeId> = (0..4).collect();
    let f_feat: Vec<f32> = ids.iter().flat_map(|&id| f_feat_of(id)).collect();
    let i_feat: Vec<i32> = ids.iter().flat_map(|&id| i_feat_of(id)).collect();
    let edges: Vec<(NodeId, NodeId)> = ids
        .iter()
        .flat_map(|&id| neighbors_of(id, num_nodes).into_iter().map(move |v| (id, v)))
        .collect();
    handle.init_data(&f_feat, &i_feat, &edges).unwrap();
    (handle, transport, num_nodes)
}

#[test]
fn all_local_completes_without_network() {
    let (handle, transport, _) = fake_shard(ServerConfig::default());
    let remote = handle.remote().unwrap().clone();
    remote.register_tag(TAG);

    let state = remote
        .get_sample_state(TAG, SamplerKind::GlobalNode)
        .expect("fresh state");
    state.lock().query = [0i64, 1, 2, 3].into_iter().collect();
    remote.query_remote(&state);

    // Synchronous: no request left the process and nothing stays in flight.
    assert_eq!(transport.pending_count(), 0);
    assert_eq!(remote.in_flight(TAG), 0);
    assert_eq!(remote.queued(TAG), 1);

    let done = remote
        .get_sample_state(TAG, SamplerKind::GlobalNode)
        .expect("completed state");
    assert!(Arc::ptr_eq(&done, &state));
    let inner = done.lock();
    assert!(inner.query.is_empty());
    for id in 0..4i64 {
        let node = &inner.recv[&id];
        assert_eq!(node.f_feat, f_feat_of(id));
        assert_eq!(node.i_feat, i_feat_of(id));
    }
}

#[test]
fn exactly_one_callback_runs_completion() {
    // Three remote groups per pass; deliver the replies in random order from
    // concurrent threads and require exactly one completion.
    for round in 0..20u64 {
        let (handle, transport, num_nodes) = fake_shard(ServerConfig::default());
        let remote = handle.remote().unwrap().clone();
        remote.register_tag(TAG);

        let state = remote
            .get_sample_state(TAG, SamplerKind::GlobalNode)
            .expect("fresh state");
        // One id per foreign shard plus one local.
        state.lock().query = [1i64, 5, 9, 13].into_iter().collect();
        remote.query_remote(&state);
        assert_eq!(remote.in_flight(TAG), 1);

        let mut pending = transport.take();
        assert_eq!(pending.len(), 3);
        let mut rng = ChaCha8Rng::seed_from_u64(round);
        pending.shuffle(&mut rng);

        let mut threads = Vec::new();
        for (_, keys, callback) in pending {
            let response = reply_for(&keys, num_nodes);
            threads.push(std::thread::spawn(move || callback(response)));
        }
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(remote.queued(TAG), 1, "exactly one requeue");
        assert_eq!(remote.in_flight(TAG), 0);
        let done = remote
            .get_sample_state(TAG, SamplerKind::GlobalNode)
            .expect("completed state");
        let inner = done.lock();
        for id in [1i64, 5, 9, 13] {
            assert_eq!(inner.recv[&id].f_feat, f_feat_of(id), "round {round}");
            assert_eq!(inner.recv[&id].edge, neighbors_of(id, num_nodes));
        }
    }
}

#[test]
fn backpressure_blocks_until_a_pass_completes() {
    let config = ServerConfig {
        server_buffer_size: 1,
        ..ServerConfig::default()
    };
    let (handle, transport, num_nodes) = fake_shard(config);
    let remote = handle.remote().unwrap().clone();
    remote.register_tag(TAG);

    let state = remote
        .get_sample_state(TAG, SamplerKind::GlobalNode)
        .expect("fresh state");
    state.lock().query = [6i64].into_iter().collect();
    remote.query_remote(&state);
    assert_eq!(remote.in_flight(TAG), 1);

    let got_state = Arc::new(AtomicBool::new(false));
    let (r2, g2) = (remote.clone(), got_state.clone());
    let waiter = std::thread::spawn(move || {
        let s = r2.get_sample_state(TAG, SamplerKind::GlobalNode);
        g2.store(true, Ordering::SeqCst);
        s
    });

    std::thread::sleep(Duration::from_millis(100));
    assert!(
        !got_state.load(Ordering::SeqCst),
        "buffer limit reached: the call must block, not start a fresh pass"
    );

    for (_, keys, callback) in transport.take() {
        callback(reply_for(&keys, num_nodes));
    }
    let unblocked = waiter.join().unwrap().expect("completed state");
    assert!(Arc::ptr_eq(&unblocked, &state));
    assert_eq!(remote.in_flight(TAG), 0);
}

#[test]
fn cache_serves_repeat_fetches() {
    let config = ServerConfig {
        cache_capacity: 64,
        cache_policy: Policy::Lru,
        ..ServerConfig::default()
    };
    let cluster = build_cluster(2, 8, config);
    let remote = cluster.handle(0).remote().unwrap().clone();
    remote.register_tag(TAG);

    let foreign: Vec<NodeId> = vec![9, 10, 11];
    let state = remote
        .get_sample_state(TAG, SamplerKind::GlobalNode)
        .expect("fresh state");
    state.lock().query = foreign.iter().copied().collect();
    remote.query_remote(&state);
    wait_until(|| remote.queued(TAG) == 1);

    let first = remote.profile();
    assert_eq!(first.total, 3);
    assert_eq!(first.nonlocal, 3);
    assert_eq!(first.cache_miss, 3);
    let done = remote.get_sample_state(TAG, SamplerKind::GlobalNode).unwrap();
    for &id in &foreign {
        assert_eq!(done.lock().recv[&id].f_feat, f_feat_of(id));
    }

    // Same ids again: every one is a cache hit, no round trip.
    let again = remote
        .get_sample_state(TAG, SamplerKind::GlobalNode)
        .expect("fresh state");
    again.lock().query = foreign.iter().copied().collect();
    remote.query_remote(&again);
    assert_eq!(remote.queued(TAG), 1, "cache hits complete inline");
    let second = remote.profile();
    assert_eq!(second.total, 6);
    assert_eq!(second.nonlocal, 6);
    assert_eq!(second.cache_miss, 3, "no new misses");
    let done = remote.get_sample_state(TAG, SamplerKind::GlobalNode).unwrap();
    for &id in &foreign {
        assert_eq!(done.lock().recv[&id].f_feat, f_feat_of(id));
        assert_eq!(
            done.lock().recv[&id].edge,
            neighbors_of(id, cluster.num_nodes)
        );
    }
}

#[test]
fn stop_sampling_releases_a_blocked_minibatch_pull() {
    let (handle, _transport, _) = fake_shard(ServerConfig::default());
    // Batch larger than the local range, so every pass needs a remote reply
    // the parked transport never delivers and no minibatch is ever produced.
    let tag = handle
        .add_sampler(SamplerSpec::GlobalNode { batch_size: 8 }, None)
        .unwrap();

    let h2 = handle.clone();
    let puller = std::thread::spawn(move || h2.serve_graph_pull(&[tag]));
    std::thread::sleep(Duration::from_millis(100));
    assert!(
        !puller.is_finished(),
        "pull must block while nothing is produced"
    );

    handle.stop_sampling();
    let reply = puller.join().unwrap();
    assert_eq!(reply.batch.tag, INVALID_TAG);
    assert_eq!(handle.active_samplers(), 0);
}

#[test]
fn cache_can_only_initialize_once() {
    let (handle, _transport, _) = fake_shard(ServerConfig {
        cache_capacity: 8,
        ..ServerConfig::default()
    });
    let remote = handle.remote().unwrap();
    assert!(remote.init_cache(16, Policy::Lfu).is_err());
}
