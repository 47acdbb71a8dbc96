use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::StreamError;
use crate::retry::RetryPolicy;

/// What `start` does when another turn in the session is still streaming.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Cancel the in-flight turn, then start (used by regenerate).
    #[default]
    CancelPrevious,
    /// Wait until the in-flight turn reaches a terminal state.
    Queue,
}

/// Tunables for the controller and its assemblers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum out-of-order frames held per turn.
    #[serde(default = "default_reorder_capacity")]
    pub reorder_capacity: usize,
    /// How long a sequence gap may stay open.
    #[serde(default = "default_gap_timeout_ms")]
    pub gap_timeout_ms: u64,
    /// Consecutive undecodable frames that error a turn.
    #[serde(default = "default_max_decode_failures")]
    pub max_consecutive_decode_failures: u32,
    /// Bounded event buffer between a turn task and its handle.
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,
    /// Finished turns kept in the session history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Non-terminal turns (streaming or queued) a session may hold at once.
    #[serde(default = "default_max_live_turns")]
    pub max_live_turns: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub default_policy: ConcurrencyPolicy,
}

const fn default_reorder_capacity() -> usize {
    16
}

const fn default_gap_timeout_ms() -> u64 {
    5_000
}

const fn default_max_decode_failures() -> u32 {
    3
}

const fn default_event_buffer_capacity() -> usize {
    128
}

const fn default_history_limit() -> usize {
    50
}

const fn default_max_live_turns() -> usize {
    8
}

/// Longest accepted sequence-gap window.
pub const MAX_GAP_TIMEOUT_MS: u64 = 60 * 60 * 1_000;

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reorder_capacity: default_reorder_capacity(),
            gap_timeout_ms: default_gap_timeout_ms(),
            max_consecutive_decode_failures: default_max_decode_failures(),
            event_buffer_capacity: default_event_buffer_capacity(),
            history_limit: default_history_limit(),
            max_live_turns: default_max_live_turns(),
            retry: RetryPolicy::default(),
            default_policy: ConcurrencyPolicy::default(),
        }
    }
}

impl StreamConfig {
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    /// Defaults overlaid with `STOCKCHAT_*` environment variables.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`StreamConfig::from_env`] but reads values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StreamError> {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "STOCKCHAT_REORDER_CAPACITY")? {
            config.reorder_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "STOCKCHAT_GAP_TIMEOUT_MS")? {
            config.gap_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "STOCKCHAT_MAX_DECODE_FAILURES")? {
            config.max_consecutive_decode_failures = v;
        }
        if let Some(v) = parse_var(&lookup, "STOCKCHAT_HISTORY_LIMIT")? {
            config.history_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "STOCKCHAT_MAX_LIVE_TURNS")? {
            config.max_live_turns = v;
        }
        if let Some(v) = parse_var(&lookup, "STOCKCHAT_MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "STOCKCHAT_RETRY_BACKOFF_MS")? {
            config.retry.initial_backoff_ms = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects limits that would make the controller unusable.
    pub fn validate(&self) -> Result<(), StreamError> {
        let zero = |name: &str| StreamError::Config(format!("{name} must be greater than 0"));
        if self.reorder_capacity == 0 {
            return Err(zero("reorder_capacity"));
        }
        if self.gap_timeout_ms == 0 {
            return Err(zero("gap_timeout_ms"));
        }
        if self.gap_timeout_ms > MAX_GAP_TIMEOUT_MS {
            return Err(StreamError::Config(format!(
                "gap_timeout_ms must be at most {MAX_GAP_TIMEOUT_MS}, got {}",
                self.gap_timeout_ms
            )));
        }
        if self.max_consecutive_decode_failures == 0 {
            return Err(zero("max_consecutive_decode_failures"));
        }
        if self.event_buffer_capacity == 0 {
            return Err(zero("event_buffer_capacity"));
        }
        if self.history_limit == 0 {
            return Err(zero("history_limit"));
        }
        if self.max_live_turns == 0 {
            return Err(zero("max_live_turns"));
        }
        self.retry.validate()
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, StreamError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = lookup(key).filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| StreamError::Config(format!("invalid {key}={raw:?}: {e}")))
}

/// Opaque credential handed over by the auth collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Reads `STOCKCHAT_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self, StreamError> {
        let token = std::env::var("STOCKCHAT_SESSION_TOKEN").unwrap_or_default();
        if token.trim().is_empty() {
            return Err(StreamError::Config(
                "missing STOCKCHAT_SESSION_TOKEN for the chat backend".into(),
            ));
        }
        Ok(Self(token))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_protocol_limits() {
        let config = StreamConfig::default();
        assert_eq!(config.reorder_capacity, 16);
        assert_eq!(config.gap_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_consecutive_decode_failures, 3);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.max_live_turns, 8);
        assert_eq!(config.default_policy, ConcurrencyPolicy::CancelPrevious);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = StreamConfig::from_lookup(lookup(&[
            ("STOCKCHAT_GAP_TIMEOUT_MS", "250"),
            ("STOCKCHAT_MAX_RETRIES", "0"),
            ("STOCKCHAT_HISTORY_LIMIT", " 5 "),
        ]))
        .expect("config");
        assert_eq!(config.gap_timeout_ms, 250);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.history_limit, 5);
        assert_eq!(config.reorder_capacity, 16);
    }

    #[test]
    fn invalid_env_values_are_config_errors() {
        let err = StreamConfig::from_lookup(lookup(&[("STOCKCHAT_REORDER_CAPACITY", "many")]))
            .expect_err("not a number");
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("STOCKCHAT_REORDER_CAPACITY")));
        let err = StreamConfig::from_lookup(lookup(&[("STOCKCHAT_REORDER_CAPACITY", "0")]))
            .expect_err("zero capacity");
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("reorder_capacity")));
    }

    #[test]
    fn oversized_gap_timeout_is_rejected() {
        let err = StreamConfig::from_lookup(lookup(&[(
            "STOCKCHAT_GAP_TIMEOUT_MS",
            "18446744073709551615",
        )]))
        .expect_err("gap timeout beyond the cap");
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("gap_timeout_ms")));
    }

    #[test]
    fn retry_backoff_is_validated_with_the_rest() {
        let err = StreamConfig::from_lookup(lookup(&[("STOCKCHAT_RETRY_BACKOFF_MS", "60000")]))
            .expect_err("initial backoff above the ceiling");
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("max_backoff_ms")));
        let config = StreamConfig::from_lookup(lookup(&[
            ("STOCKCHAT_RETRY_BACKOFF_MS", "0"),
            ("STOCKCHAT_MAX_LIVE_TURNS", "2"),
        ]))
        .expect("zero backoff is allowed");
        assert_eq!(config.retry.next_delay(0), Some(Duration::ZERO));
        assert_eq!(config.max_live_turns, 2);
    }

    #[test]
    fn partial_json_config_uses_defaults() {
        let config: StreamConfig =
            serde_json::from_str(r#"{"gap_timeout_ms": 1000, "default_policy": "queue"}"#)
                .expect("deserialize");
        assert_eq!(config.gap_timeout_ms, 1000);
        assert_eq!(config.default_policy, ConcurrencyPolicy::Queue);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn session_token_debug_is_redacted() {
        let token = SessionToken::new("secret-123");
        assert!(!format!("{token:?}").contains("secret"));
        assert_eq!(token.expose(), "secret-123");
    }
}
