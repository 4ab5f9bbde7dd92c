//! State machine definition model.
//!
//! A definition is a `StateMachine` whose root `StateGraph` maps state names to
//! `State` values. `State` is internally tagged by the JSON `Type` field; each
//! variant holds the fields of that state type for both query languages. Which
//! of those fields may appear is decided by the state's effective query
//! language and enforced when the definition is loaded, so a parsed `State`
//! never carries fields of the other dialect.
//!
//! Nested graphs (Parallel branches, Map item processors) are shared through
//! `Arc` so concurrent branches and items can hold them without copying.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::choice::ChoiceBranch;
use crate::map::{ItemBatcher, ItemReader, ResultWriter};
use crate::policy::{Catcher, Retrier};

// ---------------------------------------------------------------------------
// QueryLanguage
// ---------------------------------------------------------------------------

/// The expression dialect a state is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QueryLanguage {
    /// Path dialect: `InputPath`, `Parameters`, `ResultPath`, `*.$` keys.
    #[default]
    #[serde(rename = "JSONPath")]
    JsonPath,
    /// Functional dialect: `Arguments`, `Output`, `{% ... %}` expressions.
    #[serde(rename = "JSONata", alias = "JEXL")]
    Functional,
}

impl fmt::Display for QueryLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JsonPath => f.write_str("JSONPath"),
            Self::Functional => f.write_str("JSONata"),
        }
    }
}

// ---------------------------------------------------------------------------
// StateMachine / StateGraph
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateMachine {
    #[serde(flatten)]
    pub graph: Arc<StateGraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_language: Option<QueryLanguage>,
    /// Upper bound on the whole execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A set of states with an entry point. Used for the root machine, each
/// Parallel branch and each Map item processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateGraph {
    pub start_at: String,
    pub states: HashMap<String, State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Map `ItemProcessor` only: `{ Mode, ExecutionType }`. Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor_config: Option<Value>,
}

impl StateGraph {
    pub fn get(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }
}

// ---------------------------------------------------------------------------
// Dynamic values and transitions
// ---------------------------------------------------------------------------

/// A field that is either a literal or a functional `{% %}` expression.
///
/// Path-dialect forms live in sibling `*Path` fields; see [`Dynamic`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralOrExpr<T> {
    Literal(T),
    Expression(String),
}

/// A resolved view over a field that may be given literally, by path, or by
/// expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Dynamic<T> {
    Literal(T),
    /// Path-dialect reference (`TimeoutSecondsPath`, `ErrorPath`, ...).
    Path(String),
    /// Functional-dialect `{% ... %}` text.
    Expression(String),
}

impl<T: Clone> Dynamic<T> {
    /// Combine a literal-or-expression field with its `*Path` sibling.
    pub fn from_fields(value: &Option<LiteralOrExpr<T>>, path: &Option<String>) -> Option<Self> {
        match (value, path) {
            (Some(LiteralOrExpr::Literal(v)), _) => Some(Self::Literal(v.clone())),
            (Some(LiteralOrExpr::Expression(e)), _) => Some(Self::Expression(e.clone())),
            (None, Some(p)) => Some(Self::Path(p.clone())),
            (None, None) => None,
        }
    }
}

impl Dynamic<String> {
    /// String-valued fields: `{% %}` text is an expression, anything else a
    /// literal.
    pub fn from_text(value: &Option<String>, path: &Option<String>) -> Option<Self> {
        match (value, path) {
            (Some(v), _) if is_expression(v) => Some(Self::Expression(v.clone())),
            (Some(v), _) => Some(Self::Literal(v.clone())),
            (None, Some(p)) => Some(Self::Path(p.clone())),
            (None, None) => None,
        }
    }
}

/// Whether a string is a whole functional expression (`{% ... %}`).
pub fn is_expression(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.len() >= 4 && trimmed.starts_with("{%") && trimmed.ends_with("%}")
}

/// Where control goes after a state completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<'a> {
    Next(&'a str),
    End,
}

/// Deserialize helper distinguishing an explicit `null` from an absent key.
///
/// Absent => `None`, `null` => `Some(None)`, a value => `Some(Some(v))`.
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One state, tagged by its `Type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum State {
    Task(TaskState),
    Pass(PassState),
    Choice(ChoiceState),
    Wait(WaitState),
    Succeed(SucceedState),
    Fail(FailState),
    Map(MapState),
    Parallel(ParallelState),
}

/// Path-dialect I/O fields shared by states that support them. `None` means
/// the field is absent; `Some(None)` is an explicit `null`.
pub trait PathIo {
    fn input_path(&self) -> Option<Option<&str>> {
        None
    }
    fn output_path(&self) -> Option<Option<&str>> {
        None
    }
    fn result_path(&self) -> Option<Option<&str>> {
        None
    }
}

macro_rules! opt_str {
    ($field:expr) => {
        $field.as_ref().map(|inner| inner.as_deref())
    };
}

impl State {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Task(_) => "Task",
            Self::Pass(_) => "Pass",
            Self::Choice(_) => "Choice",
            Self::Wait(_) => "Wait",
            Self::Succeed(_) => "Succeed",
            Self::Fail(_) => "Fail",
            Self::Map(_) => "Map",
            Self::Parallel(_) => "Parallel",
        }
    }

    pub fn query_language(&self) -> Option<QueryLanguage> {
        match self {
            Self::Task(s) => s.query_language,
            Self::Pass(s) => s.query_language,
            Self::Choice(s) => s.query_language,
            Self::Wait(s) => s.query_language,
            Self::Succeed(s) => s.query_language,
            Self::Fail(s) => s.query_language,
            Self::Map(s) => s.query_language,
            Self::Parallel(s) => s.query_language,
        }
    }

    pub fn comment(&self) -> Option<&str> {
        match self {
            Self::Task(s) => s.comment.as_deref(),
            Self::Pass(s) => s.comment.as_deref(),
            Self::Choice(s) => s.comment.as_deref(),
            Self::Wait(s) => s.comment.as_deref(),
            Self::Succeed(s) => s.comment.as_deref(),
            Self::Fail(s) => s.comment.as_deref(),
            Self::Map(s) => s.comment.as_deref(),
            Self::Parallel(s) => s.comment.as_deref(),
        }
    }

    /// Variable assignments evaluated after the state completes.
    pub fn assign(&self) -> Option<&Value> {
        match self {
            Self::Task(s) => s.assign.as_ref(),
            Self::Pass(s) => s.assign.as_ref(),
            Self::Choice(s) => s.assign.as_ref(),
            Self::Wait(s) => s.assign.as_ref(),
            Self::Map(s) => s.assign.as_ref(),
            Self::Parallel(s) => s.assign.as_ref(),
            Self::Succeed(_) | Self::Fail(_) => None,
        }
    }

    /// Functional-dialect `Output` template.
    pub fn output(&self) -> Option<&Value> {
        match self {
            Self::Task(s) => s.output.as_ref(),
            Self::Pass(s) => s.output.as_ref(),
            Self::Choice(s) => s.output.as_ref(),
            Self::Wait(s) => s.output.as_ref(),
            Self::Succeed(s) => s.output.as_ref(),
            Self::Map(s) => s.output.as_ref(),
            Self::Parallel(s) => s.output.as_ref(),
            Self::Fail(_) => None,
        }
    }

    /// Declared `Next`/`End` of a non-terminal, non-Choice state.
    ///
    /// Returns `None` for Choice, Succeed and Fail, and for a state that
    /// declares neither (rejected at load time).
    pub fn transition(&self) -> Option<Transition<'_>> {
        let (next, end) = match self {
            Self::Task(s) => (&s.next, s.end),
            Self::Pass(s) => (&s.next, s.end),
            Self::Wait(s) => (&s.next, s.end),
            Self::Map(s) => (&s.next, s.end),
            Self::Parallel(s) => (&s.next, s.end),
            Self::Choice(_) | Self::Succeed(_) | Self::Fail(_) => return None,
        };
        match (next, end) {
            (Some(next), _) => Some(Transition::Next(next)),
            (None, Some(true)) => Some(Transition::End),
            _ => None,
        }
    }

    /// Raw `Next`/`End` fields, for validation.
    pub fn transition_fields(&self) -> (Option<&str>, Option<bool>) {
        match self {
            Self::Task(s) => (s.next.as_deref(), s.end),
            Self::Pass(s) => (s.next.as_deref(), s.end),
            Self::Wait(s) => (s.next.as_deref(), s.end),
            Self::Map(s) => (s.next.as_deref(), s.end),
            Self::Parallel(s) => (s.next.as_deref(), s.end),
            Self::Choice(_) | Self::Succeed(_) | Self::Fail(_) => (None, None),
        }
    }

    /// Every state name this state can transition to, including catcher
    /// targets and Choice rule targets.
    pub fn successors(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let (Some(next), _) = self.transition_fields() {
            out.push(next);
        }
        let catchers: &[Catcher] = match self {
            Self::Task(s) => &s.catch,
            Self::Map(s) => &s.catch,
            Self::Parallel(s) => &s.catch,
            _ => &[],
        };
        out.extend(catchers.iter().map(|c| c.next.as_str()));
        if let Self::Choice(choice) = self {
            out.extend(choice.choices.iter().map(|b| b.next.as_str()));
            if let Some(default) = &choice.default {
                out.push(default);
            }
        }
        out
    }

    /// Path-dialect I/O view for states that carry one.
    pub fn path_io(&self) -> &dyn PathIo {
        match self {
            Self::Task(s) => s,
            Self::Pass(s) => s,
            Self::Choice(s) => s,
            Self::Wait(s) => s,
            Self::Succeed(s) => s,
            Self::Map(s) => s,
            Self::Parallel(s) => s,
            Self::Fail(s) => s,
        }
    }

    /// Retry policy (Task, Map, Parallel).
    pub fn retry(&self) -> &[Retrier] {
        match self {
            Self::Task(s) => &s.retry,
            Self::Map(s) => &s.retry,
            Self::Parallel(s) => &s.retry,
            _ => &[],
        }
    }

    /// Catch policy (Task, Map, Parallel).
    pub fn catch(&self) -> &[Catcher] {
        match self {
            Self::Task(s) => &s.catch,
            Self::Map(s) => &s.catch,
            Self::Parallel(s) => &s.catch,
            _ => &[],
        }
    }

    /// Path-dialect `ResultSelector`.
    pub fn result_selector(&self) -> Option<&Value> {
        match self {
            Self::Task(s) => s.result_selector.as_ref(),
            Self::Map(s) => s.result_selector.as_ref(),
            Self::Parallel(s) => s.result_selector.as_ref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Invokes an external resource by identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_language: Option<QueryLanguage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub input_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub output_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub result_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<LiteralOrExpr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_seconds: Option<LiteralOrExpr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_seconds_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
}

impl TaskState {
    pub fn timeout(&self) -> Option<Dynamic<u64>> {
        Dynamic::from_fields(&self.timeout_seconds, &self.timeout_seconds_path)
    }

    pub fn heartbeat(&self) -> Option<Dynamic<u64>> {
        Dynamic::from_fields(&self.heartbeat_seconds, &self.heartbeat_seconds_path)
    }
}

impl PathIo for TaskState {
    fn input_path(&self) -> Option<Option<&str>> {
        opt_str!(self.input_path)
    }
    fn output_path(&self) -> Option<Option<&str>> {
        opt_str!(self.output_path)
    }
    fn result_path(&self) -> Option<Option<&str>> {
        opt_str!(self.result_path)
    }
}

// ---------------------------------------------------------------------------
// Pass
// ---------------------------------------------------------------------------

/// Passes its input (or a fixed `Result`) to its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PassState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_language: Option<QueryLanguage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub input_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub output_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub result_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign: Option<Value>,
}

impl PathIo for PassState {
    fn input_path(&self) -> Option<Option<&str>> {
        opt_str!(self.input_path)
    }
    fn output_path(&self) -> Option<Option<&str>> {
        opt_str!(self.output_path)
    }
    fn result_path(&self) -> Option<Option<&str>> {
        opt_str!(self.result_path)
    }
}

// ---------------------------------------------------------------------------
// Choice
// ---------------------------------------------------------------------------

/// Branches on the first matching rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceState {
    pub choices: Vec<ChoiceBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_language: Option<QueryLanguage>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub input_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub output_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign: Option<Value>,
}

impl PathIo for ChoiceState {
    fn input_path(&self) -> Option<Option<&str>> {
        opt_str!(self.input_path)
    }
    fn output_path(&self) -> Option<Option<&str>> {
        opt_str!(self.output_path)
    }
}

// ---------------------------------------------------------------------------
// Wait
// ---------------------------------------------------------------------------

/// Delays for a number of seconds or until a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_language: Option<QueryLanguage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<LiteralOrExpr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub input_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub output_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign: Option<Value>,
}

impl WaitState {
    pub fn seconds(&self) -> Option<Dynamic<u64>> {
        Dynamic::from_fields(&self.seconds, &self.seconds_path)
    }

    pub fn timestamp(&self) -> Option<Dynamic<String>> {
        Dynamic::from_text(&self.timestamp, &self.timestamp_path)
    }
}

impl PathIo for WaitState {
    fn input_path(&self) -> Option<Option<&str>> {
        opt_str!(self.input_path)
    }
    fn output_path(&self) -> Option<Option<&str>> {
        opt_str!(self.output_path)
    }
}

// ---------------------------------------------------------------------------
// Succeed / Fail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SucceedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_language: Option<QueryLanguage>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub input_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub output_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl PathIo for SucceedState {
    fn input_path(&self) -> Option<Option<&str>> {
        opt_str!(self.input_path)
    }
    fn output_path(&self) -> Option<Option<&str>> {
        opt_str!(self.output_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_language: Option<QueryLanguage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause_path: Option<String>,
}

impl FailState {
    pub fn error(&self) -> Option<Dynamic<String>> {
        Dynamic::from_text(&self.error, &self.error_path)
    }

    pub fn cause(&self) -> Option<Dynamic<String>> {
        Dynamic::from_text(&self.cause, &self.cause_path)
    }
}

impl PathIo for FailState {}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

/// Runs a nested graph once per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_processor: Option<Arc<StateGraph>>,
    /// Legacy name for `ItemProcessor`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterator: Option<Arc<StateGraph>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_language: Option<QueryLanguage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
    /// Functional dialect: a literal array or a `{% %}` expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_selector: Option<Value>,
    /// Legacy name for `ItemSelector`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_reader: Option<ItemReader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_batcher: Option<ItemBatcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_writer: Option<ResultWriter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<LiteralOrExpr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_failure_count: Option<LiteralOrExpr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_failure_count_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_failure_percentage: Option<LiteralOrExpr<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_failure_percentage_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub input_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub output_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub result_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
}

impl MapState {
    /// The nested graph, preferring `ItemProcessor` over legacy `Iterator`.
    pub fn processor(&self) -> Option<&Arc<StateGraph>> {
        self.item_processor.as_ref().or(self.iterator.as_ref())
    }

    /// `ItemSelector`, or the legacy `Parameters` which played the same role.
    pub fn selector(&self) -> Option<&Value> {
        self.item_selector.as_ref().or(self.parameters.as_ref())
    }

    pub fn max_concurrency(&self) -> Option<Dynamic<u64>> {
        Dynamic::from_fields(&self.max_concurrency, &self.max_concurrency_path)
    }

    pub fn tolerated_failure_count(&self) -> Option<Dynamic<u64>> {
        Dynamic::from_fields(&self.tolerated_failure_count, &self.tolerated_failure_count_path)
    }

    pub fn tolerated_failure_percentage(&self) -> Option<Dynamic<f64>> {
        Dynamic::from_fields(
            &self.tolerated_failure_percentage,
            &self.tolerated_failure_percentage_path,
        )
    }
}

impl PathIo for MapState {
    fn input_path(&self) -> Option<Option<&str>> {
        opt_str!(self.input_path)
    }
    fn output_path(&self) -> Option<Option<&str>> {
        opt_str!(self.output_path)
    }
    fn result_path(&self) -> Option<Option<&str>> {
        opt_str!(self.result_path)
    }
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

/// Runs every branch concurrently over the same input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParallelState {
    pub branches: Vec<Arc<StateGraph>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_language: Option<QueryLanguage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub input_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub output_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub result_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
}

impl PathIo for ParallelState {
    fn input_path(&self) -> Option<Option<&str>> {
        opt_str!(self.input_path)
    }
    fn output_path(&self) -> Option<Option<&str>> {
        opt_str!(self.output_path)
    }
    fn result_path(&self) -> Option<Option<&str>> {
        opt_str!(self.result_path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_machine_round_trips() {
        let doc = json!({
            "Comment": "demo",
            "StartAt": "First",
            "TimeoutSeconds": 30,
            "States": {
                "First": {
                    "Type": "Task",
                    "Resource": "arn:fn:double",
                    "InputPath": null,
                    "ResultPath": "$.out",
                    "Retry": [{ "ErrorEquals": ["States.ALL"], "MaxAttempts": 2 }],
                    "Next": "Done"
                },
                "Done": { "Type": "Succeed" }
            }
        });
        let machine: StateMachine = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(machine.graph.start_at, "First");
        assert_eq!(machine.timeout_seconds, Some(30));
        assert_eq!(serde_json::to_value(&machine).unwrap(), doc);
    }

    #[test]
    fn explicit_null_differs_from_absent() {
        let task: State = serde_json::from_value(json!({
            "Type": "Task",
            "Resource": "r",
            "InputPath": null,
            "End": true
        }))
        .unwrap();
        let io = task.path_io();
        assert_eq!(io.input_path(), Some(None));
        assert_eq!(io.output_path(), None);
    }

    #[test]
    fn transition_prefers_next() {
        let pass: State = serde_json::from_value(json!({ "Type": "Pass", "Next": "B" })).unwrap();
        assert_eq!(pass.transition(), Some(Transition::Next("B")));
        let end: State = serde_json::from_value(json!({ "Type": "Pass", "End": true })).unwrap();
        assert_eq!(end.transition(), Some(Transition::End));
        let succeed: State = serde_json::from_value(json!({ "Type": "Succeed" })).unwrap();
        assert_eq!(succeed.transition(), None);
    }

    #[test]
    fn dynamic_fields_resolve_by_form() {
        let wait: State = serde_json::from_value(json!({
            "Type": "Wait",
            "Seconds": "{% $delay %}",
            "End": true
        }))
        .unwrap();
        let State::Wait(wait) = wait else { panic!("expected wait") };
        assert_eq!(wait.seconds(), Some(Dynamic::Expression("{% $delay %}".to_string())));

        let fail = FailState {
            comment: None,
            query_language: None,
            error: None,
            error_path: Some("$.code".to_string()),
            cause: Some("static".to_string()),
            cause_path: None,
        };
        assert_eq!(fail.error(), Some(Dynamic::Path("$.code".to_string())));
        assert_eq!(fail.cause(), Some(Dynamic::Literal("static".to_string())));
    }

    #[test]
    fn query_language_accepts_both_spellings() {
        let ql: QueryLanguage = serde_json::from_value(json!("JSONata")).unwrap();
        assert_eq!(ql, QueryLanguage::Functional);
        let ql: QueryLanguage = serde_json::from_value(json!("JEXL")).unwrap();
        assert_eq!(ql, QueryLanguage::Functional);
        assert_eq!(QueryLanguage::default(), QueryLanguage::JsonPath);
    }

    #[test]
    fn successors_cover_catch_and_choices() {
        let state: State = serde_json::from_value(json!({
            "Type": "Task",
            "Resource": "r",
            "Next": "A",
            "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Handler" }]
        }))
        .unwrap();
        assert_eq!(state.successors(), vec!["A", "Handler"]);
    }

    #[test]
    fn is_expression_requires_both_delimiters() {
        assert!(is_expression("{% 1 + 2 %}"));
        assert!(!is_expression("{% 1 + 2"));
        assert!(!is_expression("$.foo"));
    }
}
