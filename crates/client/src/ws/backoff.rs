//! Reconnect pacing after abnormal closures.

use std::time::Duration;

/// Configuration for auto-reconnect behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
            backoff_multiplier: 1.4,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (0-based), capped at
    /// `max_delay_ms`.
    ///
    /// Fractional milliseconds are truncated. The f64 product is quantized
    /// to whole microseconds first so float noise from `powi` cannot shave a
    /// millisecond (1.4^2 * 500 computes as 979.999..., which must stay 980).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let ms = ((raw * 1000.0).round() / 1000.0).floor() as u64;
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}
