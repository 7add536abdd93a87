use crate::core::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Backoff configuration for reconnection attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter,
        )
    }

    /// Delay before attempt `attempt` (0-based): `base * 2^attempt`, capped.
    /// With jitter the delay is drawn from the upper half of that window.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let capped = self.base.saturating_mul(factor).min(self.max);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let half = capped / 2;
        let spread = (capped - half).as_millis() as u64;
        half + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}
