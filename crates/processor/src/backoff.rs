//! Exponential backoff shared by the sink retry loop and source reconnection

use std::time::Duration;

/// Capped exponential backoff: `base * 2^attempt`, never above `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
}

impl ExponentialBackoff {
    /// Create a backoff policy from millisecond bounds
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
        }
    }

    /// Delay before retry number `retry_count` (zero-based)
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.pow(retry_count.min(20));
        let backoff_ms = self.base_ms.saturating_mul(factor);
        Duration::from_millis(backoff_ms.min(self.max_ms))
    }
}
