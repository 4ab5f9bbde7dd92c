//! Execution engine: walks a state graph from `StartAt` to a terminal state.
//!
//! # Execution flow
//!
//! 1. Build the `$$` context object and a shared `Runtime` (resolver, hooks,
//!    clock, random source, configuration, transition counter).
//! 2. `run_graph` enters `StartAt` and loops: count the transition, run the
//!    state, follow its `Next` (or the Choice target) until a state ends.
//! 3. Each state runs the input side of the I/O pipeline, performs its
//!    effect, then the output side. A catchable failure consults `Retry`,
//!    then `Catch`, then propagates to the caller of the current invocation.
//! 4. Map items and Parallel branches are nested `run_graph` invocations with
//!    their own copy of the context object and variables, spawned on a
//!    `JoinSet` (see [`map`] and [`parallel`]).
//!
//! A machine-level `TimeoutSeconds` bounds the whole run.

pub mod map;
pub mod parallel;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use statelang_types::choice::ChoiceBranch;
use statelang_types::config::EngineConfig;
use statelang_types::definition::{
    FailState, QueryLanguage, State, StateGraph, StateMachine, TaskState, Transition, WaitState,
};
use statelang_types::error::{ErrorOutput, ReservedError};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::choice;
use crate::definition::load_value;
use crate::error::{EvalError, RunError};
use crate::functional;
use crate::hooks::{DefaultHooks, ExecutionHooks, RetryEvent, StepCompleted, WaitRequest};
use crate::intrinsics::random::{RandomSource, SystemRandom};
use crate::pipeline::{self, Completed, Env};
use crate::policy::ErrorPolicy;
use crate::resources::ResourceResolver;
use crate::scope::Variables;

/// Clock used for Wait states and context timestamps.
pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

/// Per-run settings.
#[derive(Clone)]
pub struct RunOptions {
    pub input: Value,
    /// Merged over the engine's own `$$` object; caller values win.
    pub context_object: Option<Value>,
    /// Dialect for a machine that declares none. Falls back to
    /// `config.query_language`.
    pub query_language: Option<QueryLanguage>,
    pub now_provider: Option<NowProvider>,
    pub hooks: Arc<dyn ExecutionHooks>,
    pub random_source: Arc<dyn RandomSource>,
    pub config: EngineConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            input: Value::Object(Map::new()),
            context_object: None,
            query_language: None,
            now_provider: None,
            hooks: Arc::new(DefaultHooks),
            random_source: Arc::new(SystemRandom::new()),
            config: EngineConfig::default(),
        }
    }
}

impl RunOptions {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn with_context_object(mut self, context: Value) -> Self {
        self.context_object = Some(context);
        self
    }

    pub fn with_query_language(mut self, dialect: QueryLanguage) -> Self {
        self.query_language = Some(dialect);
        self
    }

    pub fn with_now_provider(mut self, now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.now_provider = Some(Arc::new(now));
        self
    }

    pub fn with_hooks(mut self, hooks: impl ExecutionHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_random_source(mut self, random: impl RandomSource + 'static) -> Self {
        self.random_source = Arc::new(random);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    fn default_dialect(&self) -> QueryLanguage {
        self.query_language.unwrap_or(self.config.query_language)
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// A loaded state machine bound to a resource resolver.
pub struct Interpreter {
    machine: Arc<StateMachine>,
    resolver: Arc<dyn ResourceResolver>,
}

impl Interpreter {
    pub fn new(machine: StateMachine, resolver: impl ResourceResolver + 'static) -> Self {
        Self {
            machine: Arc::new(machine),
            resolver: Arc::new(resolver),
        }
    }

    pub fn from_shared(machine: Arc<StateMachine>, resolver: Arc<dyn ResourceResolver>) -> Self {
        Self { machine, resolver }
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Execute the machine once, resolving with the terminal output.
    pub async fn run(&self, options: RunOptions) -> Result<Value, RunError> {
        let dialect = self
            .machine
            .query_language
            .unwrap_or_else(|| options.default_dialect());
        let RunOptions {
            input,
            context_object,
            now_provider,
            hooks,
            random_source,
            config,
            ..
        } = options;

        let clock: NowProvider = now_provider.unwrap_or_else(|| Arc::new(Utc::now));
        let started = clock();
        let execution_id = Uuid::now_v7();
        let context = initial_context(execution_id, &input, started, context_object);

        let rt = Arc::new(Runtime {
            resolver: Arc::clone(&self.resolver),
            hooks,
            random: random_source,
            clock,
            config,
            transitions: AtomicU64::new(0),
        });
        let frame = Frame {
            context,
            variables: Variables::new(),
            call_stack: Vec::new(),
            dialect,
        };

        tracing::info!(
            execution_id = %execution_id,
            start_at = self.machine.graph.start_at.as_str(),
            dialect = %dialect,
            "starting execution"
        );

        let execution = run_graph(Arc::clone(&rt), Arc::clone(&self.machine.graph), input, frame);
        let result = match self.machine.timeout_seconds {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), execution).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(execution_id = %execution_id, timeout_secs = secs, "execution timed out");
                    Err(RunError::failed(
                        ReservedError::Timeout,
                        format!("execution did not finish within {secs} seconds"),
                    ))
                }
            },
            None => execution.await,
        };

        let transitions = rt.transitions.load(Ordering::Relaxed);
        match &result {
            Ok(_) => tracing::info!(execution_id = %execution_id, transitions, "execution succeeded"),
            Err(e) => tracing::info!(execution_id = %execution_id, transitions, error = %e, "execution failed"),
        }
        result
    }
}

/// Load `definition` and run it once.
pub async fn run(
    definition: &Value,
    resolver: impl ResourceResolver + 'static,
    options: RunOptions,
) -> Result<Value, RunError> {
    let machine = load_value(definition, options.default_dialect())?;
    Interpreter::new(machine, resolver).run(options).await
}

// ---------------------------------------------------------------------------
// Runtime / Frame
// ---------------------------------------------------------------------------

/// Shared by every state of one execution, nested invocations included.
pub(crate) struct Runtime {
    pub(crate) resolver: Arc<dyn ResourceResolver>,
    pub(crate) hooks: Arc<dyn ExecutionHooks>,
    pub(crate) random: Arc<dyn RandomSource>,
    pub(crate) clock: NowProvider,
    pub(crate) config: EngineConfig,
    pub(crate) transitions: AtomicU64,
}

impl Runtime {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn count_transition(&self) -> Result<(), RunError> {
        let limit = self.config.max_transitions;
        if self.transitions.fetch_add(1, Ordering::Relaxed) >= limit {
            return Err(RunError::TransitionLimitExceeded { limit });
        }
        Ok(())
    }

    /// Invoke a resource, optionally under a deadline. A call that misses its
    /// deadline is detached, not cancelled. Dropping the returned future
    /// aborts the call.
    pub(crate) async fn invoke(
        &self,
        resource: &str,
        input: Value,
        timeout_secs: Option<u64>,
    ) -> Result<Value, RunError> {
        let handler = self
            .resolver
            .resolve(resource)
            .ok_or_else(|| RunError::UnknownResource(resource.to_string()))?;
        let mut call = JoinSet::new();
        call.spawn(handler.invoke(input));

        let joined = match timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), call.join_next()).await {
                Ok(joined) => joined,
                Err(_) => {
                    call.detach_all();
                    tracing::warn!(resource, timeout_secs = secs, "resource call timed out");
                    return Err(RunError::failed(
                        ReservedError::Timeout,
                        format!("resource '{resource}' did not complete within {secs} seconds"),
                    ));
                }
            },
            None => call.join_next().await,
        };
        match joined {
            Some(Ok(Ok(output))) => Ok(output),
            Some(Ok(Err(error))) => Err(RunError::Failed(error)),
            Some(Err(e)) => Err(RunError::failed(
                ReservedError::TaskFailed,
                format!("resource '{resource}' did not complete: {e}"),
            )),
            None => Err(RunError::failed(
                ReservedError::TaskFailed,
                format!("resource '{resource}' returned nothing"),
            )),
        }
    }
}

/// Abort every task in `set` and wait until they are gone.
pub(crate) async fn cancel_all<T: 'static>(set: &mut JoinSet<T>) {
    set.abort_all();
    while set.join_next().await.is_some() {}
}

/// Per-invocation state: the root run, one Map item, or one Parallel branch.
#[derive(Clone)]
pub(crate) struct Frame {
    pub(crate) context: Value,
    pub(crate) variables: Variables,
    /// Enclosing Map/Parallel state names, outermost first.
    pub(crate) call_stack: Vec<String>,
    /// Dialect for states that declare none.
    pub(crate) dialect: QueryLanguage,
}

impl Frame {
    /// Frame for a nested invocation started by `state_name`. Map items also
    /// get `$$.Map.Item`.
    pub(crate) fn child(&self, state_name: &str, item: Option<(usize, &Value)>) -> Frame {
        let context = match item {
            Some((index, value)) => with_map_item(&self.context, index, value),
            None => self.context.clone(),
        };
        let mut call_stack = self.call_stack.clone();
        call_stack.push(state_name.to_string());
        Frame {
            context,
            variables: self.variables.clone(),
            call_stack,
            dialect: self.dialect,
        }
    }
}

/// Copy of `context` with `Map.Item.{Index,Value}` set.
pub(crate) fn with_map_item(context: &Value, index: usize, value: &Value) -> Value {
    let mut context = context.clone();
    if let Value::Object(fields) = &mut context {
        fields.insert(
            "Map".to_string(),
            json!({ "Item": { "Index": index, "Value": value } }),
        );
    }
    context
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn initial_context(
    execution_id: Uuid,
    input: &Value,
    started: DateTime<Utc>,
    overrides: Option<Value>,
) -> Value {
    let mut context = json!({
        "Execution": {
            "Id": execution_id.to_string(),
            "Input": input,
            "Name": execution_id.to_string(),
            "StartTime": timestamp(started),
        },
        "StateMachine": { "Name": "statelang" },
    });
    if let (Value::Object(base), Some(Value::Object(extra))) = (&mut context, overrides) {
        for (key, value) in extra {
            match (base.get_mut(&key), value) {
                (Some(Value::Object(existing)), Value::Object(fields)) => existing.extend(fields),
                (_, value) => {
                    base.insert(key, value);
                }
            }
        }
    }
    context
}

fn set_state_context(context: &mut Value, name: &str, entered: DateTime<Utc>, retry_count: u32) {
    if let Value::Object(fields) = context {
        fields.insert(
            "State".to_string(),
            json!({ "Name": name, "EnteredTime": timestamp(entered), "RetryCount": retry_count }),
        );
    }
}

// ---------------------------------------------------------------------------
// Graph walk
// ---------------------------------------------------------------------------

/// Run `graph` from its `StartAt` to a terminal state.
pub(crate) fn run_graph(
    rt: Arc<Runtime>,
    graph: Arc<StateGraph>,
    input: Value,
    frame: Frame,
) -> BoxFuture<'static, Result<Value, RunError>> {
    Box::pin(async move {
        let mut frame = frame;
        let mut name = graph.start_at.clone();
        let mut input = input;
        loop {
            rt.count_transition()?;
            let state = graph
                .get(&name)
                .ok_or_else(|| RunError::Syntax {
                    message: format!("transition to unknown state '{name}'"),
                })?;
            let step = run_state(&rt, &name, state, input, &mut frame).await?;
            match step.next {
                Some(next) => {
                    tracing::debug!(from = name.as_str(), to = next.as_str(), "transition");
                    name = next;
                    input = step.output;
                }
                None => return Ok(step.output),
            }
        }
    })
}

/// Output of one state and where to go next (`None` ends the graph).
struct Step {
    output: Value,
    next: Option<String>,
}

/// Run one state with its Retry and Catch policy.
async fn run_state(
    rt: &Arc<Runtime>,
    name: &str,
    state: &State,
    raw: Value,
    frame: &mut Frame,
) -> Result<Step, RunError> {
    let dialect = state.query_language().unwrap_or(frame.dialect);
    // Parallel retries run per branch.
    let retriers = match state {
        State::Parallel(_) => &[][..],
        _ => state.retry(),
    };
    let mut counts = vec![0u32; retriers.len()];
    let mut retry_count = 0u32;
    let entered = rt.now();

    loop {
        set_state_context(&mut frame.context, name, entered, retry_count);
        tracing::debug!(
            state = name,
            state_type = state.type_name(),
            retry_count,
            "entering state"
        );

        let error = match execute(rt, name, state, &raw, frame, dialect).await {
            Ok(outcome) => {
                frame.variables = outcome.variables;
                notify_complete(rt, name, state, &raw, &outcome.output, frame).await;
                return Ok(Step {
                    output: outcome.output,
                    next: outcome.next,
                });
            }
            Err(RunError::Failed(error)) => error,
            Err(fatal) => return Err(fatal),
        };

        let plan = ErrorPolicy::plan_retry(retriers, &counts, &error, rt.random.as_ref());
        let event = RetryEvent {
            state_name: name.to_string(),
            error: error.clone(),
            attempt: plan.attempt,
            would_retry: plan.would_retry,
            delay: plan.delay,
        };
        if rt.hooks.on_retry(&event).await {
            let delay = match plan.retrier {
                Some(index) => {
                    counts[index] += 1;
                    plan.delay
                }
                None => Duration::ZERO,
            };
            retry_count += 1;
            tracing::warn!(
                state = name,
                error = %error,
                attempt = plan.attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying state"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        let Some(catcher) = ErrorPolicy::find_catcher(state.catch(), &error) else {
            tracing::debug!(state = name, error = %error, "state failed");
            return Err(RunError::Failed(error));
        };
        tracing::warn!(state = name, error = %error, next = catcher.next.as_str(), "caught error");
        let env = Env {
            context: &frame.context,
            variables: &frame.variables,
            random: rt.random.as_ref(),
            config: &rt.config,
            dialect,
        };
        let done = pipeline::catch_output(catcher, &raw, &error, &env)?;
        frame.variables = done.variables;
        notify_complete(rt, name, state, &raw, &done.output, frame).await;
        return Ok(Step {
            output: done.output,
            next: Some(catcher.next.clone()),
        });
    }
}

async fn notify_complete(rt: &Runtime, name: &str, state: &State, input: &Value, output: &Value, frame: &Frame) {
    let step = StepCompleted {
        state_name: name.to_string(),
        state_type: state.type_name(),
        input: input.clone(),
        output: output.clone(),
        call_stack: frame.call_stack.clone(),
    };
    rt.hooks.on_step_complete(&step).await;
}

/// A state's successful result.
struct Outcome {
    output: Value,
    variables: Variables,
    next: Option<String>,
}

impl Outcome {
    fn new(done: Completed, next: Option<String>) -> Self {
        Self {
            output: done.output,
            variables: done.variables,
            next,
        }
    }
}

fn declared_next(name: &str, state: &State) -> Result<Option<String>, RunError> {
    match state.transition() {
        Some(Transition::Next(next)) => Ok(Some(next.to_string())),
        Some(Transition::End) => Ok(None),
        None => Err(RunError::Syntax {
            message: format!("state '{name}' has neither 'Next' nor 'End'"),
        }),
    }
}

/// Input pipeline, effect, output pipeline.
async fn execute(
    rt: &Arc<Runtime>,
    name: &str,
    state: &State,
    raw: &Value,
    frame: &Frame,
    dialect: QueryLanguage,
) -> Result<Outcome, RunError> {
    let env = Env {
        context: &frame.context,
        variables: &frame.variables,
        random: rt.random.as_ref(),
        config: &rt.config,
        dialect,
    };
    let effective = pipeline::select_input(state, raw, &env)?;

    match state {
        State::Task(task) => {
            let result = run_task(rt, name, task, &effective, &env).await?;
            let done = pipeline::complete(state, raw, result, &env)?;
            Ok(Outcome::new(done, declared_next(name, state)?))
        }
        State::Pass(pass) => {
            let arguments = match dialect {
                QueryLanguage::JsonPath => pipeline::build_arguments(pass.parameters.as_ref(), &effective, &env)?,
                QueryLanguage::Functional => effective,
            };
            let result = pass.result.clone().unwrap_or(arguments);
            let done = pipeline::complete(state, raw, result, &env)?;
            Ok(Outcome::new(done, declared_next(name, state)?))
        }
        State::Choice(choice_state) => {
            let scope = env.scope(&effective);
            let matched = choice::first_match(&choice_state.choices, &scope)?;
            let (next, branch) = match matched {
                Some(index) => {
                    let branch = &choice_state.choices[index];
                    (branch.next.clone(), Some(branch))
                }
                None => match &choice_state.default {
                    Some(default) => (default.clone(), None),
                    None => {
                        return Err(RunError::failed(
                            ReservedError::NoChoiceMatched,
                            format!("no choice rule matched in state '{name}' and it has no Default"),
                        ));
                    }
                },
            };
            let mut done = pipeline::complete(state, raw, effective.clone(), &env)?;
            if let Some(branch) = branch {
                apply_branch(branch, raw, &effective, &env, &mut done)?;
            }
            Ok(Outcome::new(done, Some(next)))
        }
        State::Wait(wait) => {
            wait_until(rt, name, wait, &effective, &env).await?;
            let done = pipeline::complete(state, raw, effective, &env)?;
            Ok(Outcome::new(done, declared_next(name, state)?))
        }
        State::Succeed(_) => {
            let done = pipeline::complete(state, raw, effective, &env)?;
            Ok(Outcome::new(done, None))
        }
        State::Fail(fail) => Err(RunError::Failed(fail_error(name, fail, &effective, &env)?)),
        State::Map(map_state) => {
            let result = map::run_map(rt, name, map_state, &effective, &env, frame).await?;
            let done = pipeline::complete(state, raw, result, &env)?;
            Ok(Outcome::new(done, declared_next(name, state)?))
        }
        State::Parallel(parallel_state) => {
            let result = parallel::run_parallel(rt, name, parallel_state, &effective, &env, frame).await?;
            let done = pipeline::complete(state, raw, result, &env)?;
            Ok(Outcome::new(done, declared_next(name, state)?))
        }
    }
}

/// Apply a matched Choice branch's own `Assign` and `Output`.
fn apply_branch(
    branch: &ChoiceBranch,
    raw: &Value,
    effective: &Value,
    env: &Env<'_>,
    done: &mut Completed,
) -> Result<(), RunError> {
    let scope = match env.dialect {
        QueryLanguage::JsonPath => env.scope(effective),
        QueryLanguage::Functional => env.scope(raw).with_result(effective),
    };
    if let Some(assign) = &branch.assign {
        let base = Env {
            variables: &done.variables,
            ..*env
        };
        let variables = pipeline::apply_assign(assign, &scope, &base)?;
        done.variables = variables;
    }
    if let Some(output) = &branch.output {
        done.output = functional::evaluate_template(output, &scope).map_err(EvalError::from)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

async fn run_task(
    rt: &Arc<Runtime>,
    name: &str,
    task: &TaskState,
    effective: &Value,
    env: &Env<'_>,
) -> Result<Value, RunError> {
    let template = match env.dialect {
        QueryLanguage::JsonPath => task.parameters.as_ref(),
        QueryLanguage::Functional => task.arguments.as_ref(),
    };
    let arguments = pipeline::build_arguments(template, effective, env)?;
    let scope = env.scope(effective);

    if let Some(heartbeat) = task.heartbeat() {
        let secs: u64 = pipeline::resolve_dynamic("HeartbeatSeconds", &heartbeat, &scope)?;
        if !rt.hooks.on_heartbeat_seconds(name, secs).await {
            return Err(RunError::failed(
                ReservedError::HeartbeatTimeout,
                format!("heartbeat of {secs} seconds rejected for state '{name}'"),
            ));
        }
    }
    if let Some(credentials) = &task.credentials {
        let resolved = pipeline::evaluate_template(credentials, &scope, env.dialect)?;
        if !rt.hooks.on_credentials(name, &resolved).await {
            return Err(RunError::failed(
                ReservedError::Permissions,
                format!("credentials rejected for state '{name}'"),
            ));
        }
    }
    let timeout_secs = match task.timeout() {
        Some(timeout) => Some(pipeline::resolve_dynamic::<u64>("TimeoutSeconds", &timeout, &scope)?),
        None => rt.config.default_task_timeout_secs,
    };

    tracing::debug!(state = name, resource = task.resource.as_str(), ?timeout_secs, "invoking task");
    rt.invoke(&task.resource, arguments, timeout_secs).await
}

async fn wait_until(
    rt: &Runtime,
    name: &str,
    wait: &WaitState,
    effective: &Value,
    env: &Env<'_>,
) -> Result<(), RunError> {
    let scope = env.scope(effective);
    let now = rt.now();
    let (until, seconds) = if let Some(seconds) = wait.seconds() {
        let secs: u64 = pipeline::resolve_dynamic("Seconds", &seconds, &scope)?;
        let until = i64::try_from(secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or_else(|| {
                RunError::failed(ReservedError::Runtime, format!("Seconds value {secs} is out of range"))
            })?;
        (until, Some(secs))
    } else if let Some(timestamp) = wait.timestamp() {
        let text: String = pipeline::resolve_dynamic("Timestamp", &timestamp, &scope)?;
        let until = DateTime::parse_from_rfc3339(&text)
            .map_err(|e| {
                RunError::failed(ReservedError::Runtime, format!("invalid Timestamp '{text}': {e}"))
            })?
            .with_timezone(&Utc);
        (until, None)
    } else {
        return Err(RunError::Syntax {
            message: format!("Wait state '{name}' needs Seconds or Timestamp"),
        });
    };

    tracing::debug!(state = name, until = %until, "waiting");
    rt.hooks
        .on_wait(WaitRequest {
            state_name: name.to_string(),
            until,
            seconds,
            now,
        })
        .await;
    Ok(())
}

/// The error a Fail state raises. `Error` defaults to the state's name.
fn fail_error(name: &str, fail: &FailState, effective: &Value, env: &Env<'_>) -> Result<ErrorOutput, RunError> {
    let scope = env.scope(effective);
    let error = match fail.error() {
        Some(error) => pipeline::resolve_dynamic::<String>("Error", &error, &scope)?,
        None => name.to_string(),
    };
    let cause = match fail.cause() {
        Some(cause) => Some(pipeline::resolve_dynamic::<String>("Cause", &cause, &scope)?),
        None => None,
    };
    Ok(ErrorOutput::new(error, cause))
}
