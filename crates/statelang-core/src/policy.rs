//! Retry and Catch decisions.
//!
//! Stateless, like the rest of the policy layer: the engine owns the per-state
//! attempt counters and passes them in. A failure first consults `Retry`
//! (first retrier whose `ErrorEquals` matches), then `Catch` (first matching
//! catcher in declaration order).

use std::time::Duration;

use statelang_types::error::{ErrorOutput, ReservedError};
use statelang_types::policy::{Catcher, JitterStrategy, Retrier};

use crate::intrinsics::random::RandomSource;

// ---------------------------------------------------------------------------
// RetryPlan
// ---------------------------------------------------------------------------

/// What the retry policy would do with a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPlan {
    /// Index of the retrier whose `ErrorEquals` matched, if any.
    pub retrier: Option<usize>,
    /// 1-based number of the retry that would run next.
    pub attempt: u32,
    /// Delay before that retry.
    pub delay: Duration,
    /// Whether the matched retrier still has attempts left.
    pub would_retry: bool,
}

// ---------------------------------------------------------------------------
// ErrorPolicy
// ---------------------------------------------------------------------------

/// Stateless Retry/Catch matching.
pub struct ErrorPolicy;

impl ErrorPolicy {
    /// Whether an `ErrorEquals` list claims `error`.
    ///
    /// `States.ALL` matches everything and `States.TaskFailed` matches
    /// anything but `States.Timeout`. Other entries match the error name or,
    /// failing that, the cause text.
    pub fn matches(error_equals: &[String], error: &ErrorOutput) -> bool {
        error_equals.iter().any(|name| {
            if name == ReservedError::All.as_str() {
                return true;
            }
            if name == ReservedError::TaskFailed.as_str() && !error.is(ReservedError::Timeout) {
                return true;
            }
            *name == error.error || error.cause.as_deref() == Some(name.as_str())
        })
    }

    /// Plan the next retry for `error` given how many times each retrier has
    /// already fired.
    pub fn plan_retry(
        retriers: &[Retrier],
        counts: &[u32],
        error: &ErrorOutput,
        random: &dyn RandomSource,
    ) -> RetryPlan {
        let Some(index) = retriers
            .iter()
            .position(|retrier| Self::matches(&retrier.error_equals, error))
        else {
            return RetryPlan {
                retrier: None,
                attempt: 1,
                delay: Duration::ZERO,
                would_retry: false,
            };
        };
        let retrier = &retriers[index];
        let used = counts.get(index).copied().unwrap_or(0);
        RetryPlan {
            retrier: Some(index),
            attempt: used + 1,
            delay: Self::delay(retrier, used, random),
            would_retry: used < retrier.max_attempts(),
        }
    }

    /// Delay before retry number `used + 1`, jittered when the retrier asks.
    pub fn delay(retrier: &Retrier, used: u32, random: &dyn RandomSource) -> Duration {
        let base = retrier.base_delay_secs(used);
        let secs = match retrier.jitter() {
            JitterStrategy::None => base,
            JitterStrategy::Full => base * random.next_f64(),
        };
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    /// First catcher claiming `error`.
    pub fn find_catcher<'a>(catchers: &'a [Catcher], error: &ErrorOutput) -> Option<&'a Catcher> {
        catchers
            .iter()
            .find(|catcher| Self::matches(&catcher.error_equals, error))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsics::random::SeededRandom;
    use serde_json::json;

    fn retrier(doc: serde_json::Value) -> Retrier {
        serde_json::from_value(doc).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn all_matches_everything() {
        let err = ErrorOutput::new("Custom", None);
        assert!(ErrorPolicy::matches(&names(&["States.ALL"]), &err));
    }

    #[test]
    fn task_failed_matches_everything_but_timeout() {
        let custom = ErrorOutput::new("Custom", None);
        let timeout = ErrorOutput::reserved(ReservedError::Timeout, "late");
        let list = names(&["States.TaskFailed"]);
        assert!(ErrorPolicy::matches(&list, &custom));
        assert!(!ErrorPolicy::matches(&list, &timeout));
    }

    #[test]
    fn exact_name_or_cause() {
        let err = ErrorOutput::new("Boom", Some("disk full".to_string()));
        assert!(ErrorPolicy::matches(&names(&["Boom"]), &err));
        assert!(ErrorPolicy::matches(&names(&["disk full"]), &err));
        assert!(!ErrorPolicy::matches(&names(&["Other"]), &err));
    }

    #[test]
    fn plan_uses_first_matching_retrier_and_counts() {
        let retriers = vec![
            retrier(json!({ "ErrorEquals": ["Other"] })),
            retrier(json!({ "ErrorEquals": ["Boom"], "MaxAttempts": 2, "IntervalSeconds": 3, "BackoffRate": 2.0 })),
        ];
        let random = SeededRandom::new(1);
        let err = ErrorOutput::new("Boom", None);

        let first = ErrorPolicy::plan_retry(&retriers, &[0, 0], &err, &random);
        assert_eq!(first.retrier, Some(1));
        assert!(first.would_retry);
        assert_eq!(first.delay, Duration::from_secs(3));

        let second = ErrorPolicy::plan_retry(&retriers, &[0, 1], &err, &random);
        assert_eq!(second.delay, Duration::from_secs(6));
        assert_eq!(second.attempt, 2);

        let exhausted = ErrorPolicy::plan_retry(&retriers, &[0, 2], &err, &random);
        assert!(!exhausted.would_retry);
    }

    #[test]
    fn zero_max_attempts_never_retries() {
        let retriers = vec![retrier(json!({ "ErrorEquals": ["States.ALL"], "MaxAttempts": 0 }))];
        let random = SeededRandom::new(1);
        let plan = ErrorPolicy::plan_retry(&retriers, &[0], &ErrorOutput::new("E", None), &random);
        assert!(!plan.would_retry);
    }

    #[test]
    fn unmatched_error_has_no_retrier() {
        let retriers = vec![retrier(json!({ "ErrorEquals": ["Boom"] }))];
        let random = SeededRandom::new(1);
        let plan = ErrorPolicy::plan_retry(&retriers, &[0], &ErrorOutput::new("Other", None), &random);
        assert_eq!(plan.retrier, None);
        assert!(!plan.would_retry);
    }

    #[test]
    fn full_jitter_stays_below_base_delay() {
        let r = retrier(json!({ "ErrorEquals": ["States.ALL"], "IntervalSeconds": 4, "JitterStrategy": "FULL" }));
        let random = SeededRandom::new(99);
        for used in 0..3 {
            let delay = ErrorPolicy::delay(&r, used, &random);
            assert!(delay.as_secs_f64() < r.base_delay_secs(used));
        }
    }

    #[test]
    fn catchers_are_checked_in_order() {
        let catchers: Vec<Catcher> = serde_json::from_value(json!([
            { "ErrorEquals": ["Boom"], "Next": "A" },
            { "ErrorEquals": ["States.ALL"], "Next": "B" }
        ]))
        .unwrap();
        let boom = ErrorOutput::new("Boom", None);
        let other = ErrorOutput::new("Other", None);
        assert_eq!(ErrorPolicy::find_catcher(&catchers, &boom).unwrap().next, "A");
        assert_eq!(ErrorPolicy::find_catcher(&catchers, &other).unwrap().next, "B");
    }
}
