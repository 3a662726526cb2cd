//! Partitioned graph data server: the sampling and remote-fetch core.
//!
//! A large node-and-edge graph is split across shard processes; each shard
//! serves point pulls over its own node range and runs background samplers
//! (uniform node sampling, random walks, GraphSage-style neighborhood
//! expansion) that continuously produce minibatches into bounded queues for
//! workers to pull. Nodes a sampler needs but does not own are resolved by
//! the [`remote::RemoteFetchCoordinator`]: eviction cache first, then a
//! fan-out of asynchronous pulls to the owning shards.
//!
//! The wire/RPC layer is a collaborator behind [`transport::Transport`];
//! [`transport::LocalTransport`] covers standalone (single-process) use and
//! the integration tests.

pub mod cache;
pub mod config;
pub mod error;
pub mod queue;
pub mod random;
pub mod remote;
pub mod sampler;
pub mod server;
pub mod state;
pub mod stats;
pub mod transport;
pub mod types;

pub use cache::Policy;
pub use config::ServerConfig;
pub use error::{GraphError, Result};
pub use server::{GraphHandle, GraphPullReply, SamplerSpec};
pub use transport::{LocalTransport, Transport};
pub use types::{GraphMiniBatch, NodeData, NodeId, SamplerKind, ShardMeta, Tag, INVALID_TAG};
