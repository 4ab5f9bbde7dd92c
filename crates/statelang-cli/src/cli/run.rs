//! `statelang run`: execute a definition and print its output.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use statelang_core::hooks::{ExecutionHooks, StepCompleted, WaitRequest, split_by_bytes};
use statelang_core::resources::ResourceMap;
use statelang_core::{RunError, RunOptions, load_value};

use super::RunArgs;
use crate::config::load_engine_config;
use crate::resources::load_resources;

/// Hooks for interactive runs: steps are logged, waits can be skipped, and
/// byte batching splits greedily.
struct CliHooks {
    skip_waits: bool,
}

impl ExecutionHooks for CliHooks {
    fn on_step_complete<'a>(&'a self, step: &'a StepCompleted) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::info!(
                state = step.state_name.as_str(),
                state_type = step.state_type,
                depth = step.call_stack.len(),
                "step completed"
            );
        })
    }

    fn on_wait(&self, request: WaitRequest) -> BoxFuture<'_, ()> {
        if self.skip_waits {
            tracing::info!(state = request.state_name.as_str(), until = %request.until, "skipping wait");
            return Box::pin(async {});
        }
        let remaining = (request.until - request.now).to_std().unwrap_or_default();
        Box::pin(tokio::time::sleep(remaining))
    }

    fn on_max_input_bytes_per_batch<'a>(
        &'a self,
        _state_name: &'a str,
        items: &'a [Value],
        max_bytes: u64,
    ) -> BoxFuture<'a, Option<Vec<Vec<Value>>>> {
        Box::pin(async move { Some(split_by_bytes(items, max_bytes)) })
    }
}

/// Run the definition. Returns whether the execution succeeded.
pub async fn handle_run(args: RunArgs, json_output: bool, quiet: bool) -> Result<bool> {
    let definition = read_json(&args.definition, "definition").await?;
    let input = match (&args.input, &args.input_file) {
        (Some(text), _) => serde_json::from_str(text).context("--input is not valid JSON")?,
        (None, Some(path)) => read_json(path, "input").await?,
        (None, None) => json!({}),
    };
    let config = load_engine_config(args.config.as_deref()).await?;
    let resources = match &args.resources {
        Some(path) => load_resources(path).await?,
        None => ResourceMap::new(),
    };

    let options = RunOptions::new(input)
        .with_config(config)
        .with_hooks(CliHooks {
            skip_waits: args.skip_waits,
        });
    let dialect = options.query_language.unwrap_or(options.config.query_language);
    let machine = load_value(&definition, dialect)
        .with_context(|| format!("invalid definition {}", args.definition.display()))?;

    let result = statelang_core::Interpreter::new(machine, resources).run(options).await;
    report(result, json_output, quiet)
}

async fn read_json(path: &Path, what: &str) -> Result<Value> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {what} file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{what} file {} is not valid JSON", path.display()))
}

fn report(result: Result<Value, RunError>, json_output: bool, quiet: bool) -> Result<bool> {
    match result {
        Ok(output) => {
            if json_output {
                let body = json!({ "status": "succeeded", "output": output });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                if !quiet {
                    eprintln!("  {} Execution succeeded", style("*").green().bold());
                }
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            Ok(true)
        }
        Err(RunError::Failed(error)) => {
            if json_output {
                let body = json!({ "status": "failed", "error": error.to_value() });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                eprintln!(
                    "  {} Execution failed: {}",
                    style("x").red().bold(),
                    style(&error.error).red()
                );
                if let Some(cause) = &error.cause {
                    eprintln!("    Cause: {}", style(cause).dim());
                }
            }
            Ok(false)
        }
        Err(other) => Err(other.into()),
    }
}
