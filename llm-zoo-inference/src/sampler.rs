#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod sampler_test;

use crate::tensor::softmax;

/// Stores a logit and its associated index (token id).
#[derive(Clone, Debug)]
pub struct IndexedLogit {
    pub logit: f32,
    pub index: usize,
}

/// Top-K sampler for language model logits.
///
/// Keeps the K highest logits, converts them to probabilities with softmax and picks one
/// by weighted random selection, using a simple xorshift RNG for reproducibility.
#[derive(Debug)]
pub struct Sampler {
    pub top_k: usize,
    pub rng_state: u64,
    candidates: Vec<IndexedLogit>,
}

impl Sampler {
    /// Creates a new sampler with the given top-K and RNG seed.
    ///
    /// # Arguments
    /// * `top_k` - Number of best candidates kept (1 selects the argmax)
    /// * `rng_seed` - Random seed for reproducibility
    pub fn new(top_k: usize, rng_seed: u64) -> Self {
        assert!(top_k > 0, "Top-K must be positive");

        Self { top_k, rng_state: Self::scramble_seed(rng_seed), candidates: Vec::new() }
    }

    /// Spreads the seed over all 64 bits with a splitmix64 step.
    ///
    /// Xorshift never leaves the all-zero state, so that state is replaced.
    fn scramble_seed(seed: u64) -> u64 {
        let mut z = seed.wrapping_add(0x9E3779B97F4A7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        match z ^ (z >> 31) {
            0 => 0x9E3779B97F4A7C15,
            state => state,
        }
    }

    /// Xorshift-based random number generator.
    fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        ((self.rng_state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Weighted random selection: the first index whose cumulative probability exceeds the draw.
    fn pick(probabilities: &[f32], coin: f32) -> usize {
        let total = probabilities.iter().sum::<f32>();
        let draw = coin * total;

        let mut cdf = 0.0;
        for (i, &prob) in probabilities.iter().enumerate() {
            cdf += prob;
            if draw < cdf {
                return i;
            }
        }
        probabilities.len().saturating_sub(1)
    }

    /// Samples a token index from logits.
    ///
    /// Ties keep the lower token index first; K larger than the vocabulary keeps everything.
    pub fn sample(&mut self, logits: &[f32]) -> usize {
        assert!(!logits.is_empty(), "Cannot sample from empty logits");

        self.candidates.clear();
        self.candidates.extend(logits.iter().enumerate().map(|(index, &logit)| IndexedLogit { logit, index }));

        // stable sort (higher to lower)
        self.candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));
        self.candidates.truncate(self.top_k);

        if self.candidates.len() == 1 {
            return self.candidates[0].index;
        }

        let mut probabilities = self.candidates.iter().map(|candidate| candidate.logit).collect::<Vec<_>>();
        softmax(&mut probabilities);

        let coin = self.random_f32();
        self.candidates[Self::pick(&probabilities, coin)].index
    }
}
