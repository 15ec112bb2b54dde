//! Capped exponential backoff shared by the radio link, the broker client
//! and the traceroute scheduler.

use std::time::Duration;

/// `min(base × 2^n, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a policy; `max` is raised to `base` if smaller
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay after `exponent` doublings
    pub fn delay(&self, exponent: u32) -> Duration {
        // 2^31 seconds is beyond any sane max; clamp before shifting
        let factor = 1u32.checked_shl(exponent.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Base delay
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay ceiling
    pub fn max(&self) -> Duration {
        self.max
    }
}
