//! Retry policy for failed webhook attempts.
//!
//! The policy is pure: given how many attempts a delivery has used, its
//! budget, its base delay and whether the latest attempt succeeded, it
//! returns the state change to apply. Non-2xx responses and transport
//! failures are treated the same.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::DeliveryTransition;
use serde::{Deserialize, Serialize};

/// Largest exponent applied by exponential backoff.
const MAX_EXPONENT: u32 = 20;

/// Shortest delay ever scheduled between attempts.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// How the delay grows with the number of failed attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Every retry waits the base delay.
    Fixed,
    /// Retry `n` waits `base * n`.
    Linear,
    /// Retry `n` waits `base * 2^(n-1)`.
    #[default]
    Exponential,
}

/// Decides what happens to a delivery after each attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Growth function for the retry delay.
    pub backoff_strategy: BackoffStrategy,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_strategy: BackoffStrategy::Exponential,
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given strategy and cap.
    pub fn new(backoff_strategy: BackoffStrategy, max_delay: Duration) -> Self {
        Self { backoff_strategy, max_delay }
    }

    /// Delay before the next attempt after `attempt_count` failed attempts.
    ///
    /// Non-decreasing in `attempt_count`, capped at `max_delay` and never
    /// shorter than one millisecond.
    pub fn backoff(&self, attempt_count: i32, base_delay: Duration) -> Duration {
        let n = u32::try_from(attempt_count.max(1)).unwrap_or(1);

        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => base_delay,
            BackoffStrategy::Linear => base_delay.saturating_mul(n),
            BackoffStrategy::Exponential => {
                let exponent = (n - 1).min(MAX_EXPONENT);
                base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        delay.min(self.max_delay).max(MIN_DELAY)
    }

    /// Decides the transition after an attempt.
    ///
    /// `attempt_count` already includes the attempt just made.
    pub fn decide(
        &self,
        attempt_count: i32,
        max_attempts: i32,
        base_delay: Duration,
        success: bool,
        now: DateTime<Utc>,
    ) -> DeliveryTransition {
        if success {
            return DeliveryTransition::Succeeded;
        }
        if attempt_count >= max_attempts {
            return DeliveryTransition::Failed;
        }

        let delay = chrono::Duration::from_std(self.backoff(attempt_count, base_delay))
            .unwrap_or(chrono::Duration::MAX);
        let next_attempt_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);

        DeliveryTransition::Retry { next_attempt_at }
    }
}
