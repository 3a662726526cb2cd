//! Index selection without replacement.
//!
//! Every selecter owns an independently seeded PRNG so concurrent sampler
//! threads never contend on shared random state. Seeds come from a
//! process-wide counter, which also makes single-threaded runs reproducible.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{GraphError, Result};

static SEED_COUNTER: AtomicU64 = AtomicU64::new(1);

pub struct IndexSelecter {
    rng: StdRng,
}

impl Default for IndexSelecter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexSelecter {
    pub fn new() -> Self {
        let ticket = SEED_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::from_seed(ticket.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// One uniform index in `[0, population)`.
    pub fn rand_index(&mut self, population: usize) -> usize {
        self.rng.random_range(0..population)
    }

    /// Exactly `n` distinct indices drawn uniformly from `[0, population)`.
    ///
    /// Draw-and-reject while `n` is small; for `n > population / 2` start
    /// from the full universe and remove until `n` remain, which keeps the
    /// expected number of draws linear when `n` approaches `population`.
    pub fn unique(&mut self, n: usize, population: usize) -> Result<HashSet<usize>> {
        if n > population {
            return Err(GraphError::BadSampleRange { n, population });
        }
        let mut result = HashSet::new();
        if n <= population / 2 {
            result.reserve(n);
            while result.len() < n {
                result.insert(self.rng.random_range(0..population));
            }
        } else {
            result.reserve(population);
            result.extend(0..population);
            while result.len() > n {
                result.remove(&self.rng.random_range(0..population));
            }
        }
        Ok(result)
    }
}
