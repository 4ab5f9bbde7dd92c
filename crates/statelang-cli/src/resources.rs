//! Resource table for `statelang run`.
//!
//! A TOML file maps resource URIs to handlers:
//!
//! ```toml
//! [resources."arn:double"]
//! command = "python3"
//! args = ["double.py"]
//!
//! [resources."arn:static"]
//! result = { status = "ok" }
//!
//! [resources."arn:broken"]
//! error = "Custom.Error"
//! cause = "always fails"
//! ```
//!
//! Command handlers receive the task input as JSON on stdin and must print
//! their result as JSON on stdout. A non-zero exit fails the task; if stdout
//! holds an `{ "Error", "Cause" }` object it becomes the error, otherwise the
//! failure is `States.TaskFailed` with stderr as the cause.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use statelang_core::resources::ResourceMap;
use statelang_types::error::{ErrorOutput, ReservedError};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Default, Deserialize)]
pub struct ResourcesFile {
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,
}

/// One resource entry. Exactly one of `command`, `result` or `error` is set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub result: Option<toml::Value>,
    pub error: Option<String>,
    pub cause: Option<String>,
}

/// Read and parse a resources file.
pub async fn load_resources(path: &Path) -> Result<ResourceMap> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read resources file {}", path.display()))?;
    let file: ResourcesFile =
        toml::from_str(&content).with_context(|| format!("invalid resources file {}", path.display()))?;
    build_resources(file)
}

pub fn build_resources(file: ResourcesFile) -> Result<ResourceMap> {
    let mut map = ResourceMap::new();
    for (uri, spec) in file.resources {
        match (spec.command, spec.result, spec.error) {
            (Some(program), None, None) => {
                let args = spec.args;
                map.register(uri.clone(), move |input: Value| {
                    run_command(program.clone(), args.clone(), input)
                });
            }
            (None, Some(result), None) => {
                let result = serde_json::to_value(result)
                    .with_context(|| format!("resource '{uri}' has a result that is not valid JSON"))?;
                map.register(uri.clone(), move |_input: Value| {
                    let result = result.clone();
                    async move { Ok::<_, ErrorOutput>(result) }
                });
            }
            (None, None, Some(error)) => {
                let failure = ErrorOutput::new(error, spec.cause);
                map.register(uri.clone(), move |_input: Value| {
                    let failure = failure.clone();
                    async move { Err::<Value, _>(failure) }
                });
            }
            _ => bail!("resource '{uri}' must set exactly one of `command`, `result` or `error`"),
        }
        tracing::debug!(resource = uri.as_str(), "registered resource");
    }
    Ok(map)
}

async fn run_command(program: String, args: Vec<String>, input: Value) -> Result<Value, ErrorOutput> {
    let task_failed = |cause: String| ErrorOutput::reserved(ReservedError::TaskFailed, cause);

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| task_failed(format!("failed to start '{program}': {e}")))?;

    // Feed stdin while stdout and stderr drain, so a chatty child cannot
    // block on a full pipe.
    let stdin = child.stdin.take();
    let payload = input.to_string();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output.map_err(|e| task_failed(format!("'{program}' did not finish: {e}")))?;
    if let Err(e) = fed {
        tracing::debug!(program = program.as_str(), error = %e, "command did not read all of its input");
    }
    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        if let Ok(error) = serde_json::from_str::<ErrorOutput>(stdout.trim()) {
            return Err(error);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(task_failed(format!(
            "'{program}' exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    if stdout.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(stdout.trim())
        .map_err(|e| task_failed(format!("'{program}' printed invalid JSON: {e}")))
}
