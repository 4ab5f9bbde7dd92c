//! Functional dialect evaluator.
//!
//! Expressions are written as `{% ... %}` strings and evaluated with JEXL
//! (`jexl_eval`) against a context object built from the current scope:
//!
//! ```json
//! {
//!   "<input field>": ...,          // when the input is an object
//!   "<variable name>": ...,        // variables shadow input fields
//!   "states": {
//!     "input": <input>,
//!     "context": <context object>,
//!     "result": <task result>,     // only while shaping a result
//!     "errorOutput": <error>       // only while processing a catcher
//!   }
//! }
//! ```
//!
//! Data is always passed through the context object, never interpolated into
//! expression text.

use serde_json::{Map, Number, Value, json};
use statelang_types::definition::is_expression;

use crate::scope::Scope;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A functional expression failed to parse or evaluate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("failed to evaluate '{expression}': {message}")]
pub struct FunctionalError {
    pub expression: String,
    pub message: String,
}

impl FunctionalError {
    fn new(expression: &str, message: impl Into<String>) -> Self {
        Self {
            expression: expression.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// FunctionalEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms registered.
pub struct FunctionalEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

thread_local! {
    static EVALUATOR: FunctionalEvaluator = FunctionalEvaluator::new();
}

fn first_str(args: &[Value]) -> &str {
    args.first().and_then(Value::as_str).unwrap_or("")
}

impl FunctionalEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| Ok(json!(first_str(args).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(first_str(args).to_uppercase())))
            .with_transform("trim", |args: &[Value]| Ok(json!(first_str(args).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(Value::as_str).unwrap_or(",");
                let parts: Vec<&str> = first_str(args).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("contains", |args: &[Value]| {
                let search = args.get(1).cloned().unwrap_or(Value::Null);
                let found = match args.first() {
                    Some(Value::Array(items)) => items.contains(&search),
                    Some(Value::String(s)) => search.as_str().is_some_and(|needle| s.contains(needle)),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let prefix = args.get(1).and_then(Value::as_str).unwrap_or("");
                Ok(json!(first_str(args).starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let suffix = args.get(1).and_then(Value::as_str).unwrap_or("");
                Ok(json!(first_str(args).ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            })
            .with_transform("string", |args: &[Value]| {
                Ok(match args.first() {
                    Some(Value::String(s)) => json!(s),
                    Some(other) => json!(other.to_string()),
                    None => json!(""),
                })
            })
            .with_transform("number", |args: &[Value]| match args.first() {
                Some(Value::Number(n)) => Ok(Value::Number(n.clone())),
                Some(Value::String(s)) => s
                    .trim()
                    .parse::<f64>()
                    .map(|n| json!(n))
                    .map_err(|_| anyhow::anyhow!("'{s}' is not a number")),
                _ => Err(anyhow::anyhow!("number() expects a string or number")),
            })
            .with_transform("json", |args: &[Value]| {
                serde_json::from_str::<Value>(first_str(args))
                    .map_err(|e| anyhow::anyhow!("invalid JSON: {e}"))
            });

        Self { evaluator }
    }

    /// Evaluate the body of an expression (without delimiters).
    pub fn evaluate_body(&self, body: &str, context: &Value) -> Result<Value, String> {
        self.evaluator
            .eval_in_context(body, context)
            .map(normalize_numbers)
            .map_err(|e| e.to_string())
    }
}

impl Default for FunctionalEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Evaluate one `{% ... %}` expression.
pub fn evaluate(text: &str, scope: &Scope<'_>) -> Result<Value, FunctionalError> {
    let body = strip_delimiters(text)
        .ok_or_else(|| FunctionalError::new(text, "expression must be wrapped in {% %}"))?;
    let context = build_context(scope);
    let result = EVALUATOR
        .with(|evaluator| evaluator.evaluate_body(body, &context))
        .map_err(|message| FunctionalError::new(text, message))?;
    tracing::trace!(expression = text, "evaluated functional expression");
    Ok(result)
}

/// Evaluate an expression that must produce a boolean.
pub fn evaluate_condition(text: &str, scope: &Scope<'_>) -> Result<bool, FunctionalError> {
    match evaluate(text, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(FunctionalError::new(
            text,
            format!("condition did not evaluate to a boolean: got {other}"),
        )),
    }
}

/// Walk a template, replacing every whole-string `{% %}` value with its
/// result. Everything else is copied as-is.
pub fn evaluate_template(template: &Value, scope: &Scope<'_>) -> Result<Value, FunctionalError> {
    match template {
        Value::String(text) if is_expression(text) => evaluate(text, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_template(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, value)| Ok((key.clone(), evaluate_template(value, scope)?)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn strip_delimiters(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("{%")
        .and_then(|rest| rest.strip_suffix("%}"))
        .map(str::trim)
}

fn build_context(scope: &Scope<'_>) -> Value {
    let mut context = Map::new();
    if let Value::Object(fields) = scope.input {
        context.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    context.extend(scope.variables.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut states = Map::new();
    states.insert("input".to_string(), scope.input.clone());
    states.insert("context".to_string(), scope.context.clone());
    if let Some(result) = scope.result {
        states.insert("result".to_string(), result.clone());
    }
    if let Some(error) = scope.error_output {
        states.insert("errorOutput".to_string(), error.clone());
    }
    context.insert("states".to_string(), Value::Object(states));
    float_numbers(Value::Object(context))
}

/// JEXL literals are floats, so `count == 1` only holds when the data side
/// is a float too.
fn float_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) if !n.is_f64() => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(float_numbers).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, float_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

/// JEXL arithmetic is floating point; integral results are written back as
/// JSON integers.
fn normalize_numbers(value: Value) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < MAX_SAFE => Value::Number(Number::from(f as i64)),
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
