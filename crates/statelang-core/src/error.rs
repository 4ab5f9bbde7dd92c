//! Engine-level error types.
//!
//! Evaluator errors (`PathError`, `IntrinsicError`, `FunctionalError`) are
//! unified as `EvalError` and then converted into a `RunError`. Only
//! `RunError::Failed` is visible to Retry/Catch; every other variant aborts
//! the run.

use statelang_types::error::{DefinitionError, ErrorOutput, ReservedError};

use crate::functional::FunctionalError;
use crate::intrinsics::IntrinsicError;
use crate::path::PathError;

// ---------------------------------------------------------------------------
// EvalError
// ---------------------------------------------------------------------------

/// Any failure while evaluating an expression or template.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Intrinsic(#[from] IntrinsicError),

    #[error(transparent)]
    Functional(#[from] FunctionalError),
}

impl From<EvalError> for RunError {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::Path(PathError::ResultPathMismatch { path, message }) => {
                RunError::Failed(ErrorOutput::reserved(
                    ReservedError::ResultPathMatchFailure,
                    format!("unable to apply ResultPath '{path}': {message}"),
                ))
            }
            EvalError::Path(other) => {
                RunError::Failed(ErrorOutput::reserved(ReservedError::Runtime, other.to_string()))
            }
            EvalError::Intrinsic(IntrinsicError::Syntax { expression, message }) => {
                RunError::Syntax {
                    message: format!("invalid intrinsic '{expression}': {message}"),
                }
            }
            EvalError::Intrinsic(other) => RunError::Failed(ErrorOutput::reserved(
                ReservedError::IntrinsicFailure,
                other.to_string(),
            )),
            EvalError::Functional(err) => RunError::Failed(ErrorOutput::reserved(
                ReservedError::QueryEvaluationError,
                err.to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// RunError
// ---------------------------------------------------------------------------

/// Outcome of a failed execution.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A catchable failure that no retrier or catcher handled.
    #[error("execution failed: {0}")]
    Failed(ErrorOutput),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// A malformed construct discovered while running.
    #[error("syntax error: {message}")]
    Syntax { message: String },

    /// A Task, ItemReader or ResultWriter names a resource nobody handles.
    #[error("no handler registered for resource '{0}'")]
    UnknownResource(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("exceeded the limit of {limit} state transitions")]
    TransitionLimitExceeded { limit: u64 },
}

impl RunError {
    pub fn failed(kind: ReservedError, cause: impl Into<String>) -> Self {
        Self::Failed(ErrorOutput::reserved(kind, cause))
    }

    /// The catchable error, if this is one.
    pub fn as_failure(&self) -> Option<&ErrorOutput> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_path_mismatch_maps_to_reserved_error() {
        let err: RunError = EvalError::Path(PathError::ResultPathMismatch {
            path: "$.a.b".to_string(),
            message: "'a' is not an object".to_string(),
        })
        .into();
        let failure = err.as_failure().unwrap();
        assert!(failure.is(ReservedError::ResultPathMatchFailure));
        assert!(failure.cause.as_deref().unwrap().contains("$.a.b"));
    }

    #[test]
    fn intrinsic_syntax_error_is_fatal() {
        let err: RunError = EvalError::Intrinsic(IntrinsicError::Syntax {
            expression: "States.Array(1))".to_string(),
            message: "trailing characters".to_string(),
        })
        .into();
        assert!(err.as_failure().is_none());
        assert!(err.to_string().contains("trailing characters"));
    }

    #[test]
    fn functional_error_is_catchable() {
        let err: RunError = EvalError::Functional(FunctionalError {
            expression: "{% a + %}".to_string(),
            message: "unexpected end".to_string(),
        })
        .into();
        assert!(err.as_failure().unwrap().is(ReservedError::QueryEvaluationError));
    }
}
