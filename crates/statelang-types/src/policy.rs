//! Retry and Catch policy records.
//!
//! Optional fields are kept as written so a definition serializes back to the
//! document it was loaded from; the accessor methods apply the defaults.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default `MaxAttempts` when a retrier omits it.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default `IntervalSeconds`.
pub const DEFAULT_INTERVAL_SECONDS: u64 = 1;
/// Default `BackoffRate`.
pub const DEFAULT_BACKOFF_RATE: f64 = 2.0;

/// How retry delays are randomized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JitterStrategy {
    #[default]
    None,
    /// Scale each delay by a uniform factor in `[0, 1)`.
    Full,
}

/// One entry of a state's `Retry` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Retrier {
    pub error_equals: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_strategy: Option<JitterStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Retrier {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn interval_seconds(&self) -> u64 {
        self.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECONDS)
    }

    pub fn backoff_rate(&self) -> f64 {
        self.backoff_rate.unwrap_or(DEFAULT_BACKOFF_RATE)
    }

    pub fn jitter(&self) -> JitterStrategy {
        self.jitter_strategy.unwrap_or_default()
    }

    /// Un-jittered delay in seconds before retry number `attempt` (0-based),
    /// capped by `MaxDelaySeconds`.
    pub fn base_delay_secs(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.interval_seconds() as f64 * self.backoff_rate().powi(exponent);
        match self.max_delay_seconds {
            Some(cap) => delay.min(cap as f64),
            None => delay,
        }
    }
}

/// One entry of a state's `Catch` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Catcher {
    pub error_equals: Vec<String>,
    pub next: String,
    /// Path dialect: where the error output is placed in the raw input.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "catcher_result_path"
    )]
    pub result_path: Option<Option<String>>,
    /// Functional dialect: output template with `states.errorOutput` bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn catcher_result_path<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}
