//! The data an expression can read while a state is being processed.

use serde_json::{Map, Value};
use statelang_types::config::EngineConfig;

use crate::intrinsics::random::RandomSource;

/// Execution-scoped variables set by `Assign`.
pub type Variables = Map<String, Value>;

/// Bindings visible to path, intrinsic and functional expressions.
///
/// `input` is what `$` refers to in the path dialect and `states.input` in
/// the functional dialect. `result` and `error_output` are only bound while a
/// state's result or a caught error is being shaped.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub input: &'a Value,
    pub context: &'a Value,
    pub variables: &'a Variables,
    pub result: Option<&'a Value>,
    pub error_output: Option<&'a Value>,
    pub random: &'a dyn RandomSource,
    pub config: &'a EngineConfig,
}

impl<'a> Scope<'a> {
    pub fn new(
        input: &'a Value,
        context: &'a Value,
        variables: &'a Variables,
        random: &'a dyn RandomSource,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            input,
            context,
            variables,
            result: None,
            error_output: None,
            random,
            config,
        }
    }

    /// Same bindings with `$` pointing at a different value.
    pub fn with_input(self, input: &'a Value) -> Self {
        Self { input, ..self }
    }

    pub fn with_result(self, result: &'a Value) -> Self {
        Self {
            result: Some(result),
            ..self
        }
    }

    pub fn with_error_output(self, error_output: &'a Value) -> Self {
        Self {
            error_output: Some(error_output),
            ..self
        }
    }
}
