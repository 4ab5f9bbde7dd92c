//! Intrinsic function library (`States.*` calls in path-dialect templates).
//!
//! A call is parsed, its arguments are evaluated left to right (nested calls
//! recurse, path arguments go through the path evaluator), and the function
//! is dispatched by name. Parse failures are `IntrinsicError::Syntax`; wrong
//! arity, wrong argument types and runtime failures are reported as
//! `States.IntrinsicFailure`.

pub mod functions;
pub mod parser;
pub mod random;

use serde_json::Value;

use crate::path::{self, PathError};
use crate::scope::Scope;

use self::parser::{Arg, Call};

/// Errors raised by intrinsic parsing and evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntrinsicError {
    #[error("invalid intrinsic '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("unknown intrinsic function 'States.{0}'")]
    UnknownFunction(String),

    #[error("States.{function} expects {expected}, got {actual} argument(s)")]
    Arity {
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("States.{function}: {message}")]
    InvalidArgument { function: String, message: String },

    #[error("path argument '{path}' matched nothing")]
    MissingPath { path: String },

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Whether a template value should be routed here instead of the path
/// evaluator.
pub fn is_intrinsic(text: &str) -> bool {
    text.trim_start().starts_with("States.")
}

/// Parse and evaluate an intrinsic call.
pub fn evaluate(text: &str, scope: &Scope<'_>) -> Result<Value, IntrinsicError> {
    let call = parser::parse(text)?;
    let value = evaluate_call(&call, scope)?;
    tracing::trace!(function = call.name.as_str(), "evaluated intrinsic");
    Ok(value)
}

fn evaluate_call(call: &Call, scope: &Scope<'_>) -> Result<Value, IntrinsicError> {
    let args = call
        .args
        .iter()
        .map(|arg| match arg {
            Arg::Literal(value) => Ok(value.clone()),
            Arg::Call(inner) => evaluate_call(inner, scope),
            Arg::Path(expr) => path::evaluate(expr, scope)?.ok_or_else(|| IntrinsicError::MissingPath {
                path: expr.clone(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    functions::dispatch(&call.name, args, scope)
}
