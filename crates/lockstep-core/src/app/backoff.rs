//! Backoff policy: decides how long a contended job waits before redelivery.

use std::time::Duration;

/// Exponential backoff with a ceiling.
///
/// delay = min(base_delay * 2^attempt, max_delay)
///
/// With the defaults (2s base, 30s cap):
/// - attempt 0 (first contention): 2s
/// - attempt 1: 4s
/// - attempt 2: 8s
/// - attempt 3: 16s
/// - attempt 4 and later: 30s
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// `attempt` は再投入前のカウンタ（0 始まり）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // 2^attempt が u32 を超えたら上限に張り付く
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000), Duration::from_millis(30000))
    }
}
