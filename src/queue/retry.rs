//! Retry policy for replayed mutations.
//!
//! A pending mutation that fails replay is retried with exponential
//! backoff until `max_attempts` failures have been recorded, after which
//! it moves to the terminal failed state and is reported to the user.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  #[serde(rename = "base_delay_ms", with = "millis")]
  pub base_delay: Duration,
  #[serde(rename = "max_delay_ms", with = "millis")]
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 8,
      base_delay: Duration::from_secs(2),
      max_delay: Duration::from_secs(600),
    }
  }
}

/// What happens to a mutation after one more failed replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  /// Stay pending; timer-driven drains wait until this epoch-ms
  RetryAt(i64),
  /// Move to the terminal failed state
  GiveUp,
}

impl RetryPolicy {
  /// Delay before the next attempt, given how many failures have been
  /// recorded so far (including the one just observed).
  pub fn delay_for(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(30);
    let delay = self.base_delay.saturating_mul(1u32 << exponent);
    delay.min(self.max_delay)
  }

  /// Decide the next state after a failure. `attempts` is the count
  /// including this failure.
  pub fn on_failure(&self, attempts: u32, now_ms: i64) -> RetryDecision {
    if attempts >= self.max_attempts {
      return RetryDecision::GiveUp;
    }
    let delay = i64::try_from(self.delay_for(attempts).as_millis()).unwrap_or(i64::MAX);
    RetryDecision::RetryAt(now_ms.saturating_add(delay))
  }
}

mod millis {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}
