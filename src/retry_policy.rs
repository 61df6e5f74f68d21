// Retry Policy: fixed delay, bounded attempts

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::scheduled_item::ScheduledItem;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub retry_delay_ms: u64,
    // ceiling used when an item does not carry its own
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 10_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug)]
pub enum RetryDecision {
    Retry(ScheduledItem),
    Exhausted(ScheduledItem),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retry_delay: Duration,
    default_max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            default_max_attempts: config.max_attempts,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn attempt_ceiling(&self, item: &ScheduledItem) -> u32 {
        item.max_attempts.unwrap_or(self.default_max_attempts)
    }

    /// Decides what happens to `item` after a failed attempt at `now`.
    ///
    /// A retry is the same item with `attempt_count + 1` and an eligible time
    /// of `now + retry_delay`.
    pub fn on_failure(&self, mut item: ScheduledItem, now: Instant) -> RetryDecision {
        let ceiling = self.attempt_ceiling(&item);
        if item.attempt_count + 1 < ceiling {
            item.attempt_count += 1;
            item.eligible_at = now + self.retry_delay;
            RetryDecision::Retry(item)
        } else {
            RetryDecision::Exhausted(item)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
