//! Per-sampling-pass scratch state.
//!
//! A `SampleState` is created empty by the remote-fetch coordinator, carried
//! through one or more network round trips, and finally consumed into a
//! minibatch by its owning sampler. It is shared between the sampler thread
//! and transport callbacks, so the mutable interior lives behind a mutex and
//! the outstanding-request count is a lone atomic that decides the
//! exactly-once completion.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::types::{NodeId, NodePack, SamplerKind, Tag};

/// Algorithm-specific extension of a sampling pass.
pub enum Frontier {
    /// Plain node samplers carry no extra state.
    None,
    /// Random walk: the current walk heads and how many fetch rounds ran.
    Walk { frontier: Vec<NodeId>, round: usize },
    /// Neighborhood expansion: current frontier, the original core set,
    /// accumulated COO pairs (global ids), and the expansion round.
    Expand {
        frontier: Vec<NodeId>,
        core: HashSet<NodeId>,
        coo: Vec<(NodeId, NodeId)>,
        round: usize,
    },
}

/// Mutex-guarded interior of a sampling pass.
pub struct StateInner {
    /// Ids still to be resolved in the current round.
    pub query: HashSet<NodeId>,
    /// Resolved node data, keyed by global id. Placeholder entries exist for
    /// ids whose remote reply has not arrived yet.
    pub recv: NodePack,
    /// Ids fetched from a remote shard in the current round; inserted into
    /// the cache at completion, then cleared.
    pub remote_ids: Vec<NodeId>,
    pub frontier: Frontier,
}

pub struct SampleState {
    pub tag: Tag,
    pub kind: SamplerKind,
    pending: AtomicUsize,
    inner: Mutex<StateInner>,
}

impl SampleState {
    pub fn new(tag: Tag, kind: SamplerKind) -> Arc<Self> {
        let frontier = match kind {
            SamplerKind::RandomWalk => Frontier::Walk {
                frontier: Vec::new(),
                round: 0,
            },
            SamplerKind::GraphSage => Frontier::Expand {
                frontier: Vec::new(),
                core: HashSet::new(),
                coo: Vec::new(),
                round: 0,
            },
            _ => Frontier::None,
        };
        Arc::new(Self {
            tag,
            kind,
            pending: AtomicUsize::new(0),
            inner: Mutex::new(StateInner {
                query: HashSet::new(),
                recv: NodePack::new(),
                remote_ids: Vec::new(),
                frontier,
            }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Arm the completion counter before dispatching `groups` remote
    /// sub-requests. Must only be called with no outstanding groups.
    pub fn begin_dispatch(&self, groups: usize) {
        let prev = self.pending.swap(groups, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "dispatch with outstanding remote groups");
    }

    /// Record one group's arrival; `true` for exactly the callback that
    /// observed the counter reach zero, regardless of arrival order.
    pub fn complete_one(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_callback_completes() {
        let state = SampleState::new(0, SamplerKind::GlobalNode);
        state.begin_dispatch(4);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = state.clone();
            handles.push(std::thread::spawn(move || s.complete_one()));
        }
        let winners: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
        assert_eq!(state.pending(), 0);
    }

    #[test]
    fn frontier_matches_kind() {
        let walk = SampleState::new(0, SamplerKind::RandomWalk);
        assert!(matches!(walk.lock().frontier, Frontier::Walk { .. }));
        let sage = SampleState::new(0, SamplerKind::GraphSage);
        assert!(matches!(sage.lock().frontier, Frontier::Expand { .. }));
        let plain = SampleState::new(0, SamplerKind::LocalNode);
        assert!(matches!(plain.lock().frontier, Frontier::None));
    }
}
