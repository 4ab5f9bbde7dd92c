//! Map state runner.
//!
//! Items are sourced, remapped through `ItemSelector`, optionally batched, and
//! then processed in waves of at most `MaxConcurrency` nested invocations on a
//! `JoinSet`. Outputs are stored by original index so completion order never
//! leaks into the result.
//!
//! Failure tolerance is measured in items: a failed batch counts as every item
//! it carries. Once the state is going to fail, the current wave either runs
//! to completion or, with `cancel_wave_on_threshold`, is aborted. Later waves
//! are never dispatched.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use statelang_types::definition::{MapState, QueryLanguage};
use statelang_types::error::ReservedError;
use statelang_types::map::{ItemBatcher, ItemReader, ResultWriter};
use tokio::task::JoinSet;

use super::{Frame, Runtime, cancel_all, run_graph, with_map_item};
use crate::error::{EvalError, RunError};
use crate::path;
use crate::pipeline::{self, Env};
use crate::scope::Scope;

/// One unit of work: what the item processor receives and what
/// `$$.Map.Item.Value` shows.
struct WorkItem {
    index: usize,
    /// Items this unit stands for.
    weight: usize,
    context_value: Value,
    input: Value,
}

/// Run a Map state over its effective input and return the ordered outputs.
pub(crate) async fn run_map(
    rt: &Arc<Runtime>,
    name: &str,
    state: &MapState,
    effective: &Value,
    env: &Env<'_>,
    frame: &Frame,
) -> Result<Value, RunError> {
    let processor = state.processor().cloned().ok_or_else(|| RunError::Syntax {
        message: format!("Map state '{name}' has no ItemProcessor"),
    })?;
    let scope = env.scope(effective);

    let items = read_items(rt, name, state, effective, env).await?;
    let mut work = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let input = select_item(state, index, &item, effective, env)?;
        work.push(WorkItem {
            index,
            weight: 1,
            context_value: item,
            input,
        });
    }
    let item_count = work.len();
    if let Some(batcher) = &state.item_batcher {
        work = batch(rt, name, batcher, work, effective, env).await?;
    }

    let total = work.len();
    let tolerance = tolerated_failures(state, item_count, &scope)?;
    let max_concurrency = match state.max_concurrency() {
        Some(limit) => pipeline::resolve_dynamic::<u64>("MaxConcurrency", &limit, &scope)? as usize,
        None => 0,
    };
    let wave_size = match max_concurrency {
        0 => total.max(1),
        n => n,
    };

    tracing::info!(
        state = name,
        items = item_count,
        units = total,
        wave_size,
        tolerance = ?tolerance,
        "running map"
    );

    let mut outputs = vec![Value::Null; total];
    let mut failures = 0usize;
    let mut pending = work.into_iter().peekable();

    while pending.peek().is_some() {
        let mut wave = JoinSet::new();
        for item in pending.by_ref().take(wave_size) {
            let rt = Arc::clone(rt);
            let graph = Arc::clone(&processor);
            let child = frame.child(name, Some((item.index, &item.context_value)));
            let (index, weight) = (item.index, item.weight);
            wave.spawn(async move { (index, weight, run_graph(rt, graph, item.input, child).await) });
        }

        let mut first_error = None;
        let mut exceeded = false;
        while let Some(joined) = wave.join_next().await {
            let (index, weight, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    cancel_all(&mut wave).await;
                    return Err(RunError::failed(
                        ReservedError::TaskFailed,
                        format!("map item in state '{name}' did not complete: {e}"),
                    ));
                }
            };
            match result {
                Ok(output) => outputs[index] = output,
                Err(RunError::Failed(error)) => {
                    failures += weight;
                    tracing::warn!(state = name, index, error = %error, failures, limit = ?tolerance, "map item failed");
                    match tolerance {
                        None => {
                            first_error.get_or_insert(error);
                        }
                        Some(limit) => exceeded |= failures > limit,
                    }
                    if (first_error.is_some() || exceeded) && rt.config.cancel_wave_on_threshold {
                        cancel_all(&mut wave).await;
                        break;
                    }
                }
                Err(fatal) => {
                    cancel_all(&mut wave).await;
                    return Err(fatal);
                }
            }
        }
        if let Some(error) = first_error {
            return Err(RunError::Failed(error));
        }
        if exceeded {
            return Err(RunError::failed(
                ReservedError::ExceedToleratedFailureThreshold,
                format!("{failures} of {item_count} items failed in Map state '{name}'"),
            ));
        }
    }

    match &state.result_writer {
        Some(writer) => write_results(rt, name, writer, outputs, env).await,
        None => Ok(Value::Array(outputs)),
    }
}

// ---------------------------------------------------------------------------
// Item sourcing
// ---------------------------------------------------------------------------

async fn read_items(
    rt: &Runtime,
    name: &str,
    state: &MapState,
    effective: &Value,
    env: &Env<'_>,
) -> Result<Vec<Value>, RunError> {
    if let Some(reader) = &state.item_reader {
        return read_from_resource(rt, name, reader, effective, env).await;
    }
    let scope = env.scope(effective);
    if let Some(items) = &state.items {
        let value = pipeline::evaluate_template(items, &scope, env.dialect)?;
        return expect_array(name, "Items", value);
    }
    if let Some(expr) = &state.items_path {
        let value = path::evaluate(expr, &scope).map_err(EvalError::from)?.ok_or_else(|| {
            RunError::failed(
                ReservedError::Runtime,
                format!("ItemsPath '{expr}' matched nothing in Map state '{name}'"),
            )
        })?;
        return expect_array(name, "ItemsPath", value);
    }
    Ok(match effective {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    })
}

fn expect_array(name: &str, field: &str, value: Value) -> Result<Vec<Value>, RunError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(RunError::failed(
            ReservedError::Runtime,
            format!("{field} of Map state '{name}' must select an array, got {other}"),
        )),
    }
}

async fn read_from_resource(
    rt: &Runtime,
    name: &str,
    reader: &ItemReader,
    effective: &Value,
    env: &Env<'_>,
) -> Result<Vec<Value>, RunError> {
    let template = match env.dialect {
        QueryLanguage::JsonPath => reader.parameters.as_ref(),
        QueryLanguage::Functional => reader.arguments.as_ref(),
    };
    let mut arguments = pipeline::build_arguments(template, effective, env)?;
    if let (Value::Object(fields), Some(config)) = (&mut arguments, &reader.reader_config) {
        if !config.extra.is_empty() {
            fields.insert("ReaderConfig".to_string(), Value::Object(config.extra.clone()));
        }
    }

    let value = rt
        .invoke(&reader.resource, arguments, None)
        .await
        .map_err(|e| match e {
            RunError::Failed(error) => RunError::failed(
                ReservedError::ItemReaderFailed,
                format!("reader '{}' failed: {error}", reader.resource),
            ),
            fatal => fatal,
        })?;
    let Value::Array(mut items) = value else {
        return Err(RunError::failed(
            ReservedError::ItemReaderFailed,
            format!("reader '{}' did not return an array", reader.resource),
        ));
    };
    if let Some(max) = reader.max_items() {
        let max = pipeline::resolve_dynamic::<u64>("MaxItems", &max, &env.scope(effective))? as usize;
        if max > 0 && items.len() > max {
            items.truncate(max);
        }
    }
    tracing::debug!(state = name, resource = reader.resource.as_str(), items = items.len(), "read map items");
    Ok(items)
}

/// `ItemSelector` with `$$.Map.Item` bound. Without one, the item passes
/// through unchanged.
fn select_item(
    state: &MapState,
    index: usize,
    item: &Value,
    effective: &Value,
    env: &Env<'_>,
) -> Result<Value, RunError> {
    let Some(selector) = state.selector() else {
        return Ok(item.clone());
    };
    let context = with_map_item(env.context, index, item);
    let scope = Scope::new(effective, &context, env.variables, env.random, env.config);
    Ok(pipeline::evaluate_template(selector, &scope, env.dialect)?)
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

async fn batch(
    rt: &Runtime,
    name: &str,
    batcher: &ItemBatcher,
    work: Vec<WorkItem>,
    effective: &Value,
    env: &Env<'_>,
) -> Result<Vec<WorkItem>, RunError> {
    let scope = env.scope(effective);
    let inputs: Vec<Value> = work.into_iter().map(|item| item.input).collect();

    let per_batch = match batcher.max_items_per_batch() {
        Some(max) => pipeline::resolve_dynamic::<u64>("MaxItemsPerBatch", &max, &scope)? as usize,
        None => 0,
    };
    let mut groups: Vec<Vec<Value>> = match per_batch {
        0 => vec![inputs],
        n => inputs.chunks(n).map(<[Value]>::to_vec).collect(),
    };

    if let Some(max_bytes) = batcher.max_input_bytes_per_batch() {
        let max_bytes = pipeline::resolve_dynamic::<u64>("MaxInputBytesPerBatch", &max_bytes, &scope)?;
        let mut split = Vec::new();
        for group in &groups {
            let parts = rt
                .hooks
                .on_max_input_bytes_per_batch(name, group, max_bytes)
                .await
                .ok_or_else(|| {
                    RunError::Configuration(format!(
                        "Map state '{name}' sets MaxInputBytesPerBatch but no byte batching hook is installed"
                    ))
                })?;
            split.extend(parts);
        }
        groups = split;
    }

    let batch_input = match &batcher.batch_input {
        Some(template) => Some(pipeline::evaluate_template(template, &scope, env.dialect)?),
        None => None,
    };
    let batches = groups
        .into_iter()
        .filter(|group| !group.is_empty())
        .enumerate()
        .map(|(index, items)| {
            let weight = items.len();
            let mut unit = Map::new();
            unit.insert("Items".to_string(), Value::Array(items));
            if let Some(extra) = &batch_input {
                unit.insert("BatchInput".to_string(), extra.clone());
            }
            let unit = Value::Object(unit);
            WorkItem {
                index,
                weight,
                context_value: unit.clone(),
                input: unit,
            }
        })
        .collect::<Vec<_>>();
    tracing::debug!(state = name, batches = batches.len(), "batched map items");
    Ok(batches)
}

// ---------------------------------------------------------------------------
// Tolerance
// ---------------------------------------------------------------------------

/// Number of item failures the state absorbs, or `None` when any failure
/// fails the state. `total` counts items, not batches.
fn tolerated_failures(state: &MapState, total: usize, scope: &Scope<'_>) -> Result<Option<usize>, RunError> {
    let count = match state.tolerated_failure_count() {
        Some(count) => Some(pipeline::resolve_dynamic::<u64>("ToleratedFailureCount", &count, scope)? as usize),
        None => None,
    };
    let from_percentage = match state.tolerated_failure_percentage() {
        Some(pct) => {
            let pct = pipeline::resolve_dynamic::<f64>("ToleratedFailurePercentage", &pct, scope)?;
            if !(0.0..=100.0).contains(&pct) {
                return Err(RunError::failed(
                    ReservedError::Runtime,
                    format!("ToleratedFailurePercentage {pct} is outside 0..=100"),
                ));
            }
            Some((total as f64 * pct / 100.0).floor() as usize)
        }
        None => None,
    };
    Ok(match (count, from_percentage) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    })
}

// ---------------------------------------------------------------------------
// ResultWriter
// ---------------------------------------------------------------------------

/// Send every output through the writer resource. All calls settle before
/// failures are reported.
async fn write_results(
    rt: &Arc<Runtime>,
    name: &str,
    writer: &ResultWriter,
    outputs: Vec<Value>,
    env: &Env<'_>,
) -> Result<Value, RunError> {
    let template = match env.dialect {
        QueryLanguage::JsonPath => writer.parameters.as_ref(),
        QueryLanguage::Functional => writer.arguments.as_ref(),
    };
    let total = outputs.len();
    let mut calls = JoinSet::new();
    for (index, output) in outputs.into_iter().enumerate() {
        let mut input = pipeline::build_arguments(template, &output, env)?;
        if let Some(config) = &writer.writer_config {
            input = json!({ "Output": input, "WriterConfig": config });
        }
        let rt = Arc::clone(rt);
        let resource = writer.resource.clone();
        calls.spawn(async move { (index, rt.invoke(&resource, input, None).await) });
    }

    let mut written = vec![Value::Null; total];
    let mut failures = Vec::new();
    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok((index, Ok(value))) => written[index] = value,
            Ok((index, Err(RunError::Failed(error)))) => failures.push(format!("output {index}: {error}")),
            Ok((_, Err(fatal))) => {
                cancel_all(&mut calls).await;
                return Err(fatal);
            }
            Err(e) => failures.push(format!("writer call did not complete: {e}")),
        }
    }
    if !failures.is_empty() {
        failures.sort();
        return Err(RunError::failed(
            ReservedError::ResultWriterFailed,
            format!(
                "{} of {total} writes failed in Map state '{name}': {}",
                failures.len(),
                failures.join("; ")
            ),
        ));
    }
    Ok(Value::Array(written))
}
