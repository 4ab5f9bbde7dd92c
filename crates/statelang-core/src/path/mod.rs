//! Path dialect expression evaluator.
//!
//! Expressions start at `$` (the current input), `$$` (the context object) or
//! `$name` (an execution variable) and continue with member, index, slice,
//! wildcard, union, filter and recursive-descent selectors.
//!
//! Evaluation returns `Ok(None)` when nothing matches. That "absent" signal is
//! distinct from a JSON `null` and drives several pipeline rules (payload
//! template keys are dropped, `Assign` removes the variable, `IsPresent` is
//! false).

pub mod ast;
pub mod eval;
pub mod parser;

use serde_json::Value;

use crate::scope::Scope;

use self::ast::PathRoot;

/// Errors raised by path parsing, evaluation and placement.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PathError {
    #[error("invalid path '{path}': {message}")]
    Syntax { path: String, message: String },

    #[error("'{path}' is not a reference path")]
    NotReference { path: String },

    #[error("cannot apply '{path}': {message}")]
    ResultPathMismatch { path: String, message: String },
}

/// Evaluate `expr` against the scope's input, context and variables.
///
/// One match is returned as-is, several matches as an array, none as `None`.
pub fn evaluate(expr: &str, scope: &Scope<'_>) -> Result<Option<Value>, PathError> {
    let parsed = parser::parse(expr)?;
    let root = match &parsed.root {
        PathRoot::Input => scope.input,
        PathRoot::Context => scope.context,
        PathRoot::Variable(name) => match scope.variables.get(name) {
            Some(value) => value,
            None => return Ok(None),
        },
    };

    if parsed.selectors.is_empty() {
        return Ok(Some(root.clone()));
    }

    let mut matches = eval::select(root, &parsed.selectors);
    tracing::trace!(path = expr, matches = matches.len(), "evaluated path");
    Ok(match matches.len() {
        0 => None,
        1 => matches.pop().cloned(),
        _ => Some(Value::Array(matches.into_iter().cloned().collect())),
    })
}

/// Place `value` into a copy of `target` at reference path `path`.
///
/// `$` replaces the target entirely.
pub fn place(path: &str, target: &Value, value: Value) -> Result<Value, PathError> {
    let parsed = parser::parse(path)?;
    if !parsed.is_reference() {
        return Err(PathError::NotReference {
            path: path.to_string(),
        });
    }
    eval::place(path, target.clone(), &parsed.selectors, value)
}

/// Whether text looks like a path expression.
pub fn is_path(text: &str) -> bool {
    text.trim_start().starts_with('$')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsics::random::SeededRandom;
    use crate::scope::Variables;
    use serde_json::json;
    use statelang_types::config::EngineConfig;

    fn with_scope<T>(input: &Value, f: impl FnOnce(&Scope<'_>) -> T) -> T {
        let context = json!({ "Execution": { "Id": "exec-1" } });
        let mut variables = Variables::new();
        variables.insert("limit".to_string(), json!({ "max": 3 }));
        let random = SeededRandom::new(1);
        let config = EngineConfig::default();
        let scope = Scope::new(input, &context, &variables, &random, &config);
        f(&scope)
    }

    #[test]
    fn single_match_is_unwrapped() {
        let input = json!({ "a": { "b": 1 } });
        let out = with_scope(&input, |s| evaluate("$.a.b", s)).unwrap();
        assert_eq!(out, Some(json!(1)));
    }

    #[test]
    fn multiple_matches_become_array() {
        let input = json!({ "xs": [{ "v": 1 }, { "v": 2 }] });
        let out = with_scope(&input, |s| evaluate("$.xs[*].v", s)).unwrap();
        assert_eq!(out, Some(json!([1, 2])));
    }

    #[test]
    fn no_match_is_absent_not_null() {
        let input = json!({ "a": null });
        assert_eq!(with_scope(&input, |s| evaluate("$.missing", s)).unwrap(), None);
        assert_eq!(with_scope(&input, |s| evaluate("$.a", s)).unwrap(), Some(Value::Null));
    }

    #[test]
    fn context_and_variable_roots() {
        let input = json!({});
        assert_eq!(
            with_scope(&input, |s| evaluate("$$.Execution.Id", s)).unwrap(),
            Some(json!("exec-1"))
        );
        assert_eq!(
            with_scope(&input, |s| evaluate("$limit.max", s)).unwrap(),
            Some(json!(3))
        );
        assert_eq!(with_scope(&input, |s| evaluate("$unknown", s)).unwrap(), None);
    }

    #[test]
    fn dollar_alone_returns_whole_input() {
        let input = json!([1, 2]);
        assert_eq!(with_scope(&input, |s| evaluate("$", s)).unwrap(), Some(json!([1, 2])));
    }

    #[test]
    fn malformed_expression_is_an_error() {
        let input = json!({});
        let err = with_scope(&input, |s| evaluate("$.a[", s)).unwrap_err();
        assert!(matches!(err, PathError::Syntax { .. }));
    }

    #[test]
    fn place_requires_reference_path() {
        let err = place("$.a[*]", &json!({}), json!(1)).unwrap_err();
        assert!(matches!(err, PathError::NotReference { .. }));
    }

    #[test]
    fn place_merges_into_copy() {
        let input = json!({ "keep": true });
        let out = place("$.result", &input, json!(5)).unwrap();
        assert_eq!(out, json!({ "keep": true, "result": 5 }));
        assert_eq!(input, json!({ "keep": true }));
    }
}
