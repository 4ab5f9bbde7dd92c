//! Path-dialect payload templates (`Parameters`, `ResultSelector`,
//! `ItemSelector`, `Assign`, ...).
//!
//! A key ending in `.$` has its suffix dropped and its string value replaced
//! by the result of a path expression or an intrinsic call. A `.$` key whose
//! path matches nothing is omitted from the output. Everything else is copied
//! through, recursing into nested objects and arrays.

use serde_json::{Map, Value};

use crate::error::EvalError;
use crate::intrinsics;
use crate::path::{self, PathError};
use crate::scope::Scope;

const DYNAMIC_SUFFIX: &str = ".$";

/// Expand a payload template against `scope`.
pub fn expand(template: &Value, scope: &Scope<'_>) -> Result<Value, EvalError> {
    match template {
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, value) in fields {
                if let Some((name, resolved)) = expand_entry(key, value, scope)? {
                    out.insert(name, resolved);
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| expand(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Expand one `key: value` pair of a template object, returning the output
/// key and value, or `None` when a `.$` path matched nothing.
pub fn expand_entry(
    key: &str,
    value: &Value,
    scope: &Scope<'_>,
) -> Result<Option<(String, Value)>, EvalError> {
    match key.strip_suffix(DYNAMIC_SUFFIX) {
        Some(name) => Ok(resolve_dynamic(key, value, scope)?.map(|v| (name.to_string(), v))),
        None => Ok(Some((key.to_string(), expand(value, scope)?))),
    }
}

/// Value of a single `.$` entry; `None` when the path matched nothing.
fn resolve_dynamic(key: &str, value: &Value, scope: &Scope<'_>) -> Result<Option<Value>, EvalError> {
    let Value::String(text) = value else {
        return Err(EvalError::Path(PathError::Syntax {
            path: key.to_string(),
            message: "a '.$' field must hold a path or intrinsic string".to_string(),
        }));
    };
    if intrinsics::is_intrinsic(text) {
        return Ok(Some(intrinsics::evaluate(text, scope)?));
    }
    Ok(path::evaluate(text, scope)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsics::random::SeededRandom;
    use crate::scope::Variables;
    use serde_json::json;
    use statelang_types::config::EngineConfig;

    fn run(template: Value, input: Value) -> Result<Value, EvalError> {
        let context = json!({ "Execution": { "Name": "demo" } });
        let mut variables = Variables::new();
        variables.insert("limit".to_string(), json!(10));
        let random = SeededRandom::new(3);
        let config = EngineConfig::default();
        let scope = Scope::new(&input, &context, &variables, &random, &config);
        expand(&template, &scope)
    }

    #[test]
    fn expands_paths_context_and_variables() {
        let out = run(
            json!({
                "id.$": "$.order.id",
                "execution.$": "$$.Execution.Name",
                "limit.$": "$limit",
                "fixed": "text",
                "nested": { "first.$": "$.order.items[0]" }
            }),
            json!({ "order": { "id": 7, "items": ["a", "b"] } }),
        )
        .unwrap();
        assert_eq!(
            out,
            json!({
                "id": 7,
                "execution": "demo",
                "limit": 10,
                "fixed": "text",
                "nested": { "first": "a" }
            })
        );
    }

    #[test]
    fn absent_paths_drop_the_key() {
        let out = run(json!({ "x.$": "$.missing", "y": 1 }), json!({})).unwrap();
        assert_eq!(out, json!({ "y": 1 }));
    }

    #[test]
    fn intrinsic_values_are_called() {
        let out = run(json!({ "n.$": "States.MathAdd($.a, 2)" }), json!({ "a": 3 })).unwrap();
        assert_eq!(out, json!({ "n": 5 }));
    }

    #[test]
    fn arrays_are_walked() {
        let out = run(json!([{ "v.$": "$.a" }, 3]), json!({ "a": true })).unwrap();
        assert_eq!(out, json!([{ "v": true }, 3]));
    }

    #[test]
    fn non_string_dynamic_value_is_rejected() {
        assert!(run(json!({ "x.$": 5 }), json!({})).is_err());
    }
}
