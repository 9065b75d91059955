//! Jitter strategies.
//!
//! Retry delays get jitter to avoid thundering herds; scheduled publish jobs
//! get a much larger [`Jitter::Range`] spread to emulate human-paced posting.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Jitter {
    /// Use the delay unchanged.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`.
    Equal,
    /// Uniform in `[min, max]`, ignoring the input delay entirely.
    Range { min: Duration, max: Duration },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Absolute spread, independent of any backoff delay. `min > max` is
    /// normalized by swapping.
    pub fn range(min: Duration, max: Duration) -> Self {
        if min > max {
            Jitter::Range { min: max, max: min }
        } else {
            Jitter::Range { min, max }
        }
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Same as [`apply`](Self::apply) with a caller-supplied RNG, for
    /// deterministic tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
            Jitter::Range { min, max } => {
                let lo = min.as_millis() as u64;
                let hi = max.as_millis() as u64;
                if lo >= hi {
                    return *min;
                }
                Duration::from_millis(rng.random_range(lo..=hi))
            }
        }
    }
}
