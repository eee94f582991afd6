//! Seeded randomness for chaos mode and random failure injection.
//!
//! The same seed misses the same readouts and draws the same frame jitter, so
//! a failing chaos run can be replayed.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

/// Shortest frame interval jitter may produce.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Seeded from the OS when `seed` is `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// True with probability `rate`, clamped to `[0, 1]`.
    pub fn chance(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen_bool(rate)
    }

    /// `base` stretched or shrunk by up to `spread` of itself.
    pub fn jitter(&self, base: Duration, spread: f64) -> Duration {
        if spread <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = spread.min(1.0);
        let factor = self.inner.lock().gen_range((1.0 - spread)..=(1.0 + spread));
        base.mul_f64(factor).max(MIN_INTERVAL)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockRng")
    }
}
