//! Request bodies for the inference endpoint.

use std::sync::Mutex;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

/// Number of inputs per request unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 2;

/// Short sentiment phrases that inputs are picked from unless configured otherwise.
pub const DEFAULT_CANDIDATES: [&str; 8] = [
    "this is great",
    "this is awful",
    "i love it",
    "i hate this",
    "fantastic work",
    "terrible idea",
    "pretty good",
    "not good",
];

/// The JSON body of an inference request.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InferRequest {
    /// Texts to classify in one batch.
    pub inputs: Vec<String>,
}

/// Produces request bodies with randomly picked inputs.
///
/// Inputs are sampled uniformly and with replacement, so the same candidate may appear more than
/// once in a batch.
#[derive(Debug)]
pub struct PayloadGenerator {
    candidates: Vec<String>,
    batch_size: usize,
    rng: Mutex<SmallRng>,
}

impl PayloadGenerator {
    /// Creates a generator over `candidates` that is reproducible for the same `seed`.
    pub fn new(candidates: Vec<String>, batch_size: usize, seed: u64) -> Self {
        Self {
            candidates,
            batch_size,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    /// Returns the body for the next request.
    ///
    /// The batch is empty if there are no candidates.
    pub fn next_request(&self) -> InferRequest {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let inputs = (0..self.batch_size)
            .filter_map(|_| self.candidates.choose(&mut *rng))
            .cloned()
            .collect();

        InferRequest { inputs }
    }
}
