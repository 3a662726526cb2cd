//! Transport seam between shards.
//!
//! The core treats the RPC layer as a black box: send a request at a target
//! shard, get an eventual callback with the reply. `LocalTransport` is the
//! in-process implementation used by standalone deployments and the
//! integration tests; a networked deployment plugs its own `Transport` in
//! without the coordinator noticing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::queue::BoundedQueue;
use crate::server::GraphHandle;
use crate::types::{NodeId, Rank};

/// Point-pull request: resolve these globally identified nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePullRequest {
    pub keys: Vec<NodeId>,
}

/// Point-pull reply: per-node feature rows flattened back to back, neighbor
/// lists concatenated, and an offset table with `offset[i]..offset[i + 1]`
/// delimiting node i's neighbors. `offset[last]` must equal `edge.len()`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePullResponse {
    pub f_feat: Vec<f32>,
    pub i_feat: Vec<i32>,
    pub edge: Vec<NodeId>,
    pub offset: Vec<usize>,
}

/// Invoked on an arbitrary transport thread when the reply arrives.
pub type PullCallback = Box<dyn FnOnce(NodePullResponse) + Send>;

/// Asynchronous request/callback service connecting shards.
pub trait Transport: Send + Sync + 'static {
    fn node_pull(&self, target: Rank, request: NodePullRequest, callback: PullCallback);
}

enum Job {
    Pull {
        target: Rank,
        request: NodePullRequest,
        callback: PullCallback,
    },
    Shutdown,
}

/// In-process transport: routes pulls to registered handles on a small
/// worker pool, modeling the asynchronous delivery of a real RPC layer.
///
/// Handles are held weakly; the process owns its `GraphHandle`s and the
/// transport never keeps one alive.
pub struct LocalTransport {
    handles: RwLock<HashMap<Rank, Weak<GraphHandle>>>,
    jobs: Arc<BoundedQueue<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalTransport {
    pub fn new(workers: usize, queue_capacity: usize) -> Arc<Self> {
        let transport = Arc::new(Self {
            handles: RwLock::new(HashMap::new()),
            jobs: Arc::new(BoundedQueue::new(queue_capacity)),
            workers: Mutex::new(Vec::new()),
        });
        let mut threads = transport.workers.lock();
        for i in 0..workers.max(1) {
            let this = Arc::downgrade(&transport);
            let jobs = transport.jobs.clone();
            let thread = std::thread::Builder::new()
                .name(format!("transport-{i}"))
                .spawn(move || worker_loop(this, jobs))
                .expect("spawn transport worker");
            threads.push(thread);
        }
        drop(threads);
        transport
    }

    pub fn register(&self, rank: Rank, handle: &Arc<GraphHandle>) {
        self.handles.write().insert(rank, Arc::downgrade(handle));
    }

    /// Stop the worker pool after in-flight jobs finish.
    pub fn shutdown(&self) {
        let mut threads = std::mem::take(&mut *self.workers.lock());
        for _ in 0..threads.len() {
            self.jobs.push(Job::Shutdown);
        }
        for thread in threads.drain(..) {
            if let Err(err) = thread.join() {
                tracing::error!(?err, "transport worker panicked");
            }
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for LocalTransport {
    fn node_pull(&self, target: Rank, request: NodePullRequest, callback: PullCallback) {
        self.jobs.push(Job::Pull {
            target,
            request,
            callback,
        });
    }
}

fn worker_loop(transport: Weak<LocalTransport>, jobs: Arc<BoundedQueue<Job>>) {
    loop {
        let Some(job) = jobs.pop() else {
            break;
        };
        match job {
            Job::Shutdown => break,
            Job::Pull {
                target,
                request,
                callback,
            } => {
                let Some(transport) = transport.upgrade() else {
                    break;
                };
                let handle = transport
                    .handles
                    .read()
                    .get(&target)
                    .and_then(Weak::upgrade);
                let Some(handle) = handle else {
                    tracing::warn!(target, "node pull for an unregistered shard dropped");
                    continue;
                };
                // A peer asking this shard for nodes it does not own is a
                // protocol violation; an unwind here would only kill this
                // worker and strand the requester, so terminate the process.
                let response = match handle.serve_node_pull(&request.keys) {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::error!(%err, target, "node pull integrity violation");
                        std::process::abort();
                    }
                };
                callback(response);
            }
        }
    }
}
