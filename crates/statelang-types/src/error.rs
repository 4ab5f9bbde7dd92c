//! Error records shared by the definition model and the engine.
//!
//! `ErrorOutput` is the value that flows through Retry/Catch and is what a
//! failed execution reports to its caller. `ReservedError` enumerates the
//! `States.*` names the engine itself raises.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorOutput
// ---------------------------------------------------------------------------

/// A failure raised by a state, a task handler, or the engine.
///
/// Serialized as `{ "Error": "...", "Cause": "..." }`, which is also the shape
/// a catcher places into the state's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorOutput {
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Cause", default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorOutput {
    /// Build an error with a custom name and optional cause.
    pub fn new(error: impl Into<String>, cause: Option<String>) -> Self {
        Self {
            error: error.into(),
            cause,
        }
    }

    /// Build one of the engine's own `States.*` errors.
    pub fn reserved(kind: ReservedError, cause: impl Into<String>) -> Self {
        Self {
            error: kind.as_str().to_string(),
            cause: Some(cause.into()),
        }
    }

    /// Whether this error carries the given reserved name.
    pub fn is(&self, kind: ReservedError) -> bool {
        self.error == kind.as_str()
    }

    /// JSON form used for `$` in catcher processing and `states.errorOutput`.
    pub fn to_value(&self) -> serde_json::Value {
        // Serializing a struct of two strings cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for ErrorOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.error, cause),
            None => f.write_str(&self.error),
        }
    }
}

impl std::error::Error for ErrorOutput {}

// ---------------------------------------------------------------------------
// ReservedError
// ---------------------------------------------------------------------------

/// Error names reserved by the language, all carrying the `States.` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedError {
    /// Wildcard used only in `ErrorEquals`.
    All,
    Timeout,
    HeartbeatTimeout,
    TaskFailed,
    BranchFailed,
    NoChoiceMatched,
    ResultPathMatchFailure,
    Permissions,
    QueryEvaluationError,
    IntrinsicFailure,
    ResultWriterFailed,
    ExceedToleratedFailureThreshold,
    ItemReaderFailed,
    /// A path expression could not be evaluated.
    Runtime,
}

impl ReservedError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "States.ALL",
            Self::Timeout => "States.Timeout",
            Self::HeartbeatTimeout => "States.HeartbeatTimeout",
            Self::TaskFailed => "States.TaskFailed",
            Self::BranchFailed => "States.BranchFailed",
            Self::NoChoiceMatched => "States.NoChoiceMatched",
            Self::ResultPathMatchFailure => "States.ResultPathMatchFailure",
            Self::Permissions => "States.Permissions",
            Self::QueryEvaluationError => "States.QueryEvaluationError",
            Self::IntrinsicFailure => "States.IntrinsicFailure",
            Self::ResultWriterFailed => "States.ResultWriterFailed",
            Self::ExceedToleratedFailureThreshold => "States.ExceedToleratedFailureThreshold",
            Self::ItemReaderFailed => "States.ItemReaderFailed",
            Self::Runtime => "States.Runtime",
        }
    }
}

impl fmt::Display for ReservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DefinitionError
// ---------------------------------------------------------------------------

/// Errors found while loading or validating a state machine definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("invalid definition JSON: {0}")]
    Parse(String),

    #[error("state machine has no state named '{0}' (StartAt)")]
    MissingStart(String),

    #[error("state '{state}' transitions to unknown state '{target}'")]
    UnknownTarget { state: String, target: String },

    #[error("invalid state name '{0}': names must be 1-80 characters")]
    InvalidStateName(String),

    #[error("field '{field}' is not allowed on a {state_type} state using {dialect} (state '{state}')")]
    FieldNotAllowed {
        state: String,
        state_type: String,
        dialect: String,
        field: String,
    },

    #[error("state '{state}' is missing required field '{field}'")]
    MissingField { state: String, field: String },

    #[error("state '{state}' must have exactly one of 'Next' or 'End'")]
    Transition { state: String },

    #[error("state '{state}' is not reachable from StartAt")]
    Unreachable { state: String },

    #[error("invalid value for '{field}' in state '{state}': {message}")]
    InvalidValue {
        state: String,
        field: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_output_serializes_with_pascal_case_keys() {
        let err = ErrorOutput::reserved(ReservedError::Timeout, "took too long");
        assert_eq!(
            err.to_value(),
            serde_json::json!({ "Error": "States.Timeout", "Cause": "took too long" })
        );
    }

    #[test]
    fn error_output_without_cause_omits_key() {
        let err = ErrorOutput::new("Custom", None);
        assert_eq!(err.to_value(), serde_json::json!({ "Error": "Custom" }));
        assert_eq!(err.to_string(), "Custom");
    }

    #[test]
    fn error_output_display_includes_cause() {
        let err = ErrorOutput::new("Oops", Some("bad input".to_string()));
        assert_eq!(err.to_string(), "Oops: bad input");
    }

    #[test]
    fn reserved_names_carry_prefix() {
        assert_eq!(ReservedError::All.as_str(), "States.ALL");
        assert_eq!(
            ReservedError::ExceedToleratedFailureThreshold.to_string(),
            "States.ExceedToleratedFailureThreshold"
        );
        assert!(ErrorOutput::reserved(ReservedError::BranchFailed, "x").is(ReservedError::BranchFailed));
    }

    #[test]
    fn definition_error_display() {
        let err = DefinitionError::UnknownTarget {
            state: "A".to_string(),
            target: "B".to_string(),
        };
        assert!(err.to_string().contains("'B'"));
    }
}
