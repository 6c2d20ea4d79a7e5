use std::time::Duration;

use crate::config::{WatchConfig, DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_MS};

/// Exponential reconnect schedule: `min(cap, base * 2^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            cap: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    pub fn from_config(cfg: &WatchConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.effective_reconnect_base_ms()),
            Duration::from_millis(cfg.effective_reconnect_max_ms()),
        )
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(1u64 << shift).min(cap_ms))
    }

    /// `delay(attempt)` scaled into `[d/2, d]` by `unit`, which must be drawn from `[0, 1)`.
    pub fn jittered(&self, attempt: u32, unit: f64) -> Duration {
        let d = self.delay(attempt);
        let unit = if unit.is_finite() { unit.clamp(0.0, 1.0) } else { 1.0 };
        d.mul_f64(0.5 + 0.5 * unit)
    }
}
