//! Backoff curves for retry paths.
//!
//! Two consumers with different shapes share this module: the dispatcher
//! requeue path (`2^n` seconds capped at `max_backoff`) and the batch
//! pipeline (`base * 2^(attempt-1)`). Both are expressible as
//! [`Backoff::exponential`] with the right base and cap.

use std::time::Duration;

/// Upper bound applied to every strategy so a misconfigured cap can never
/// produce a multi-day sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Delay curve for retries. Attempt numbers are 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay for every attempt.
    Constant { delay: Duration },
    /// `base * attempt`.
    Linear { base: Duration },
    /// `base * 2^(attempt-1)`, optionally capped.
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    /// Cap exponential growth. No effect on the other strategies.
    pub fn with_max(mut self, cap: Duration) -> Self {
        if let Backoff::Exponential { max, .. } = &mut self {
            *max = Some(cap);
        }
        self
    }

    /// Delay before the given attempt (1-indexed), saturating on overflow
    /// and clamped to [`MAX_BACKOFF`].
    pub fn delay(&self, attempt: usize) -> Duration {
        let raw = match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => {
                base.checked_mul(attempt as u32).unwrap_or(MAX_BACKOFF)
            }
            Backoff::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 2u32.saturating_pow(exponent);
                let grown = base.checked_mul(multiplier).unwrap_or(MAX_BACKOFF);
                match max {
                    Some(cap) => grown.min(*cap),
                    None => grown,
                }
            }
        };
        raw.min(MAX_BACKOFF)
    }
}
