//! Per-state input/output processing.
//!
//! The path dialect runs `InputPath` -> `Parameters` -> effect ->
//! `ResultSelector` -> `ResultPath` -> `OutputPath`. The functional dialect
//! runs `Arguments` -> effect -> `Output`. Both finish with `Assign`, which is
//! evaluated against the variables as they were when the state was entered.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use statelang_types::config::EngineConfig;
use statelang_types::definition::{Dynamic, QueryLanguage, State};
use statelang_types::error::{ErrorOutput, ReservedError};
use statelang_types::policy::Catcher;

use crate::error::{EvalError, RunError};
use crate::functional;
use crate::intrinsics::random::RandomSource;
use crate::path;
use crate::scope::{Scope, Variables};
use crate::template;

// ---------------------------------------------------------------------------
// Env
// ---------------------------------------------------------------------------

/// Bindings shared by every scope built while processing one state.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    pub context: &'a Value,
    pub variables: &'a Variables,
    pub random: &'a dyn RandomSource,
    pub config: &'a EngineConfig,
    pub dialect: QueryLanguage,
}

impl<'a> Env<'a> {
    /// A scope with `$` / `states.input` bound to `input`.
    pub fn scope<'s>(&self, input: &'s Value) -> Scope<'s>
    where
        'a: 's,
    {
        Scope::new(input, self.context, self.variables, self.random, self.config)
    }
}

/// What a state produces once its pipeline has run.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub output: Value,
    pub variables: Variables,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Step 1: `InputPath`. The functional dialect passes the raw input through.
pub fn select_input(state: &State, raw: &Value, env: &Env<'_>) -> Result<Value, EvalError> {
    if env.dialect == QueryLanguage::Functional {
        return Ok(raw.clone());
    }
    match state.path_io().input_path() {
        None => Ok(raw.clone()),
        Some(None) => Ok(Value::Object(Map::new())),
        Some(Some(expr)) => Ok(path::evaluate(expr, &env.scope(raw))?.unwrap_or(Value::Null)),
    }
}

/// Step 2: `Parameters` (path) or `Arguments` (functional). Without a
/// template the effective input is passed as-is.
pub fn build_arguments(
    template: Option<&Value>,
    effective: &Value,
    env: &Env<'_>,
) -> Result<Value, EvalError> {
    let Some(template) = template else {
        return Ok(effective.clone());
    };
    evaluate_template(template, &env.scope(effective), env.dialect)
}

/// Steps 4-7 for a state whose effect produced `result`.
///
/// States without an effect (Choice, Wait, Succeed) pass their effective input
/// as `result`; they have no `ResultPath`, so it flows straight to
/// `OutputPath`.
pub fn complete(
    state: &State,
    raw: &Value,
    result: Value,
    env: &Env<'_>,
) -> Result<Completed, EvalError> {
    match env.dialect {
        QueryLanguage::JsonPath => {
            let shaped = match state.result_selector() {
                Some(selector) => template::expand(selector, &env.scope(&result))?,
                None => result,
            };
            let variables = match state.assign() {
                Some(assign) => apply_assign(assign, &env.scope(&shaped), env)?,
                None => env.variables.clone(),
            };
            let placed = place_result(state.path_io().result_path(), raw, shaped)?;
            let output = select_output(state.path_io().output_path(), &placed, env)?;
            Ok(Completed { output, variables })
        }
        QueryLanguage::Functional => {
            let scope = env.scope(raw).with_result(&result);
            let variables = match state.assign() {
                Some(assign) => apply_assign(assign, &scope, env)?,
                None => env.variables.clone(),
            };
            let output = match state.output() {
                Some(template) => functional::evaluate_template(template, &scope)?,
                None => result.clone(),
            };
            Ok(Completed { output, variables })
        }
    }
}

/// Step 5: `ResultPath`. Absent keeps the result, `null` keeps the raw input,
/// a path merges the result into a copy of the raw input.
pub fn place_result(
    result_path: Option<Option<&str>>,
    raw: &Value,
    result: Value,
) -> Result<Value, EvalError> {
    match result_path {
        None => Ok(result),
        Some(None) => Ok(raw.clone()),
        Some(Some(expr)) => Ok(path::place(expr, raw, result)?),
    }
}

/// Step 6: `OutputPath`.
pub fn select_output(
    output_path: Option<Option<&str>>,
    placed: &Value,
    env: &Env<'_>,
) -> Result<Value, EvalError> {
    match output_path {
        None => Ok(placed.clone()),
        Some(None) => Ok(Value::Object(Map::new())),
        Some(Some(expr)) => Ok(path::evaluate(expr, &env.scope(placed))?.unwrap_or(Value::Null)),
    }
}

/// Step 7: evaluate an `Assign` block and merge it over the current variables.
///
/// Every entry sees the variables from before the block; a later key wins on
/// collision. A path entry that resolves to nothing removes the variable.
pub fn apply_assign(assign: &Value, scope: &Scope<'_>, env: &Env<'_>) -> Result<Variables, EvalError> {
    let mut variables = env.variables.clone();
    let Value::Object(entries) = assign else {
        return Ok(variables);
    };
    for (key, value) in entries {
        match env.dialect {
            QueryLanguage::JsonPath => match template::expand_entry(key, value, scope)? {
                Some((name, resolved)) => {
                    variables.insert(name, resolved);
                }
                None => {
                    variables.remove(key.trim_end_matches(".$"));
                }
            },
            QueryLanguage::Functional => {
                let resolved = functional::evaluate_template(value, scope)?;
                variables.insert(key.clone(), resolved);
            }
        }
    }
    tracing::trace!(count = entries.len(), "applied Assign");
    Ok(variables)
}

/// Expand a template in the given dialect.
pub fn evaluate_template(
    template: &Value,
    scope: &Scope<'_>,
    dialect: QueryLanguage,
) -> Result<Value, EvalError> {
    match dialect {
        QueryLanguage::JsonPath => template::expand(template, scope),
        QueryLanguage::Functional => Ok(functional::evaluate_template(template, scope)?),
    }
}

// ---------------------------------------------------------------------------
// Catchers
// ---------------------------------------------------------------------------

/// Output and variables for a matched catcher.
///
/// Path dialect: the error object is placed at the catcher's `ResultPath`
/// (default `$`, replacing the input). Functional dialect: the catcher's
/// `Output` is evaluated with `states.errorOutput` bound, defaulting to the
/// error object itself.
pub fn catch_output(
    catcher: &Catcher,
    raw: &Value,
    error: &ErrorOutput,
    env: &Env<'_>,
) -> Result<Completed, EvalError> {
    let error_value = error.to_value();
    match env.dialect {
        QueryLanguage::JsonPath => {
            let variables = match &catcher.assign {
                Some(assign) => apply_assign(assign, &env.scope(&error_value), env)?,
                None => env.variables.clone(),
            };
            let result_path = catcher.result_path.as_ref().map(|p| p.as_deref());
            let output = place_result(result_path, raw, error_value.clone())?;
            Ok(Completed { output, variables })
        }
        QueryLanguage::Functional => {
            let scope = env.scope(raw).with_error_output(&error_value);
            let variables = match &catcher.assign {
                Some(assign) => apply_assign(assign, &scope, env)?,
                None => env.variables.clone(),
            };
            let output = match &catcher.output {
                Some(template) => functional::evaluate_template(template, &scope)?,
                None => error_value.clone(),
            };
            Ok(Completed { output, variables })
        }
    }
}

// ---------------------------------------------------------------------------
// Dynamic fields
// ---------------------------------------------------------------------------

/// Resolve a literal / `*Path` / `{% %}` field to a concrete value.
pub fn resolve_dynamic<T>(
    field: &str,
    dynamic: &Dynamic<T>,
    scope: &Scope<'_>,
) -> Result<T, RunError>
where
    T: DeserializeOwned + Clone,
{
    let value = match dynamic {
        Dynamic::Literal(v) => return Ok(v.clone()),
        Dynamic::Path(expr) => path::evaluate(expr, scope)
            .map_err(EvalError::from)?
            .ok_or_else(|| {
                RunError::failed(
                    ReservedError::Runtime,
                    format!("{field}: path '{expr}' matched nothing"),
                )
            })?,
        Dynamic::Expression(expr) => functional::evaluate(expr, scope).map_err(EvalError::from)?,
    };
    serde_json::from_value(value.clone()).map_err(|e| {
        let kind = match dynamic {
            Dynamic::Expression(_) => ReservedError::QueryEvaluationError,
            _ => ReservedError::Runtime,
        };
        RunError::failed(kind, format!("{field}: unexpected value {value}: {e}"))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
