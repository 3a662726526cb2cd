//! Error taxonomy for the graph store.
//!
//! Everything here is a fatal integrity violation from the point of view of a
//! serving process: the binary edge is expected to treat these as
//! unrecoverable and exit with a diagnostic. Expected conditions (cache miss,
//! empty frontier, empty queue) are modeled with `Option` at the call sites
//! and never surface as errors.

use crate::types::{NodeId, Tag};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("shape mismatch during bulk load: {0}")]
    ShapeMismatch(String),

    #[error("invalid shard offset table: {0}")]
    BadOffsets(String),

    #[error("node {id} is not owned by shard {rank}")]
    NotLocal { id: NodeId, rank: usize },

    #[error("sampler tag {0} is already registered")]
    DuplicateTag(Tag),

    #[error("training index has {have} candidates, batch size needs {need}")]
    InsufficientTrainNodes { have: usize, need: usize },

    #[error("cannot draw {n} distinct indices from a population of {population}")]
    BadSampleRange { n: usize, population: usize },

    #[error("remote-fetch cache is already initialized")]
    CacheAlreadyInitialized,

    #[error("handle is not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("handle already finished loading; data is immutable while serving")]
    AlreadyServing,

    #[error("invalid sampler parameters: {0}")]
    InvalidSampler(String),

    #[error("invalid configuration: {0}")]
    BadConfig(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;
