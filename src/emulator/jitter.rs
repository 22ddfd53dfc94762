//! Seeded readback noise.

use crate::protocol::MAX_MAGNITUDE;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Bounded uniform noise from a seeded generator.
///
/// The same seed and the same sequence of calls give the same readbacks, so
/// emulator scenarios are reproducible.
pub struct JitterSource {
    rng: ChaCha8Rng,
    bound: f64,
}

impl JitterSource {
    /// Noise in `[-bound, +bound]`.
    ///
    /// The bound is capped at the largest value the wire can carry; a NaN
    /// bound means no noise.
    pub fn new(seed: u64, bound: f64) -> Self {
        let bound = if bound.is_nan() {
            0.0
        } else {
            bound.abs().min(MAX_MAGNITUDE)
        };
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            bound,
        }
    }

    /// Configured bound.
    pub fn bound(&self) -> f64 {
        self.bound
    }

    /// Next noise sample.
    pub fn sample(&mut self) -> f64 {
        if self.bound == 0.0 {
            return 0.0;
        }
        self.rng.gen_range(-self.bound..=self.bound)
    }

    /// `value` plus noise, never negative.
    pub fn apply(&mut self, value: f64) -> f64 {
        (value + self.sample()).max(0.0)
    }
}

impl std::fmt::Debug for JitterSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitterSource")
            .field("rng", &"<ChaCha8Rng>")
            .field("bound", &self.bound)
            .finish()
    }
}
