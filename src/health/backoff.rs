use std::time::Duration;

use crate::config::PeerHealthConfig;

/// Exponential retry delay for unhealthy peers: `base · 2^(failures-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_config(config: &PeerHealthConfig) -> Self {
        Self::new(config.backoff_base, config.max_backoff)
    }

    /// Delay before the next probe after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        match failures.checked_sub(1) {
            None => Duration::ZERO,
            Some(exponent) => {
                let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
                self.base.saturating_mul(factor).min(self.max)
            }
        }
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
