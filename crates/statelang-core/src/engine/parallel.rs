//! Parallel state runner.

use std::sync::Arc;

use serde_json::Value;
use statelang_types::definition::{ParallelState, QueryLanguage, StateGraph};
use statelang_types::error::ReservedError;
use statelang_types::policy::Retrier;
use tokio::task::JoinSet;

use super::{Frame, Runtime, cancel_all, run_graph};
use crate::error::RunError;
use crate::hooks::RetryEvent;
use crate::pipeline::{self, Env};
use crate::policy::ErrorPolicy;

/// Run every branch over the same input. The first branch that definitively
/// fails fails the state; the others are aborted before it returns.
pub(crate) async fn run_parallel(
    rt: &Arc<Runtime>,
    name: &str,
    state: &ParallelState,
    effective: &Value,
    env: &Env<'_>,
    frame: &Frame,
) -> Result<Value, RunError> {
    let template = match env.dialect {
        QueryLanguage::JsonPath => state.parameters.as_ref(),
        QueryLanguage::Functional => state.arguments.as_ref(),
    };
    let input = pipeline::build_arguments(template, effective, env)?;
    let retriers: Arc<[Retrier]> = state.retry.clone().into();

    tracing::info!(state = name, branches = state.branches.len(), "running parallel branches");

    let mut branches = JoinSet::new();
    for (index, graph) in state.branches.iter().enumerate() {
        let branch = Branch {
            rt: Arc::clone(rt),
            state_name: name.to_string(),
            index,
            graph: Arc::clone(graph),
            retriers: Arc::clone(&retriers),
        };
        let input = input.clone();
        let child = frame.child(name, None);
        branches.spawn(async move { (index, branch.run(input, child).await) });
    }

    let mut outputs = vec![Value::Null; state.branches.len()];
    while let Some(joined) = branches.join_next().await {
        let (index, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                cancel_all(&mut branches).await;
                return Err(RunError::failed(
                    ReservedError::BranchFailed,
                    format!("a branch of Parallel state '{name}' did not complete: {e}"),
                ));
            }
        };
        match result {
            Ok(output) => outputs[index] = output,
            Err(RunError::Failed(error)) => {
                tracing::warn!(state = name, branch = index, error = %error, "branch failed");
                cancel_all(&mut branches).await;
                return Err(RunError::failed(
                    ReservedError::BranchFailed,
                    format!("branch {index} failed: {error}"),
                ));
            }
            Err(fatal) => {
                cancel_all(&mut branches).await;
                return Err(fatal);
            }
        }
    }
    Ok(Value::Array(outputs))
}

/// One branch with its own retry counters.
struct Branch {
    rt: Arc<Runtime>,
    state_name: String,
    index: usize,
    graph: Arc<StateGraph>,
    retriers: Arc<[Retrier]>,
}

impl Branch {
    async fn run(self, input: Value, frame: Frame) -> Result<Value, RunError> {
        let mut counts = vec![0u32; self.retriers.len()];
        loop {
            let error = match run_graph(Arc::clone(&self.rt), Arc::clone(&self.graph), input.clone(), frame.clone()).await
            {
                Ok(output) => return Ok(output),
                Err(RunError::Failed(error)) => error,
                Err(fatal) => return Err(fatal),
            };

            let plan = ErrorPolicy::plan_retry(&self.retriers, &counts, &error, self.rt.random.as_ref());
            let event = RetryEvent {
                state_name: self.state_name.clone(),
                error: error.clone(),
                attempt: plan.attempt,
                would_retry: plan.would_retry,
                delay: plan.delay,
            };
            if !self.rt.hooks.on_retry(&event).await {
                return Err(RunError::Failed(error));
            }
            let delay = match plan.retrier {
                Some(i) => {
                    counts[i] += 1;
                    plan.delay
                }
                None => std::time::Duration::ZERO,
            };
            tracing::warn!(
                state = self.state_name.as_str(),
                branch = self.index,
                error = %error,
                attempt = plan.attempt,
                "retrying branch"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
