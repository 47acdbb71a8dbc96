//! Reconnect schedule for dropped turn subscriptions.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::StreamError;

/// How often and how fast a turn re-subscribes after a transient disconnect.
///
/// Values are taken as given; [`RetryPolicy::validate`] rejects the ones the
/// controller cannot honor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Subscriptions opened after the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wait before the first reconnect. Zero reconnects immediately.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Growth per reconnect, at least 1.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Ceiling for a single wait.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            default_max_retries(),
            default_initial_backoff_ms(),
            default_backoff_factor(),
        )
    }
}

impl RetryPolicy {
    /// Never reconnects; the first disconnect exhausts the turn.
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn new(max_retries: u32, initial_backoff_ms: u64, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            initial_backoff_ms,
            backoff_factor,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn with_max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms;
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(StreamError::Config(format!(
                "retry.backoff_factor must be a finite number >= 1, got {}",
                self.backoff_factor
            )));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(StreamError::Config(format!(
                "retry.max_backoff_ms ({}) is below retry.initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }
        Ok(())
    }

    /// Wait before reconnect number `retries_done + 1`, or `None` once the
    /// budget is spent.
    pub fn next_delay(&self, retries_done: u32) -> Option<Duration> {
        if retries_done >= self.max_retries {
            return None;
        }
        let scaled = self.initial_backoff_ms as f64 * self.backoff_factor.powi(retries_done as i32);
        let millis = if scaled.is_finite() {
            (scaled.round() as u64).min(self.max_backoff_ms)
        } else {
            self.max_backoff_ms
        };
        Some(Duration::from_millis(millis))
    }

    /// Reconnect schedule for one turn.
    pub(crate) fn schedule(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            retries_done: 0,
        }
    }
}

/// Per-turn cursor over [`RetryPolicy::next_delay`].
#[derive(Debug)]
pub(crate) struct Backoff<'a> {
    policy: &'a RetryPolicy,
    retries_done: u32,
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.policy.next_delay(self.retries_done)?;
        self.retries_done += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_two_reconnects_from_500ms() {
        let delays: Vec<_> = RetryPolicy::default().schedule().collect();
        assert_eq!(delays, vec![Duration::from_millis(500), Duration::from_millis(1_000)]);
    }

    #[test]
    fn none_policy_never_reconnects() {
        assert_eq!(RetryPolicy::none().next_delay(0), None);
        assert_eq!(RetryPolicy::none().schedule().count(), 0);
    }

    #[test]
    fn zero_backoff_reconnects_immediately() {
        let policy = RetryPolicy::new(1, 0, 2.0);
        assert_eq!(policy.next_delay(0), Some(Duration::ZERO));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::new(40, 100, 10.0).with_max_backoff_ms(250);
        let delays: Vec<_> = policy.schedule().take(3).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(250),
                Duration::from_millis(250)
            ]
        );
        assert_eq!(policy.next_delay(39), Some(Duration::from_millis(250)));
    }

    #[test]
    fn validate_rejects_shrinking_or_inverted_backoff() {
        assert!(matches!(
            RetryPolicy::new(2, 500, 0.5).validate(),
            Err(StreamError::Config(msg)) if msg.contains("backoff_factor")
        ));
        assert!(matches!(
            RetryPolicy::new(2, 500, f64::NAN).validate(),
            Err(StreamError::Config(_))
        ));
        assert!(matches!(
            RetryPolicy::new(2, 500, 2.0).with_max_backoff_ms(100).validate(),
            Err(StreamError::Config(msg)) if msg.contains("max_backoff_ms")
        ));
    }
}
