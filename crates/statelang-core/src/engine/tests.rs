use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use statelang_types::config::EngineConfig;
use statelang_types::error::{ErrorOutput, ReservedError};

use super::*;
use crate::hooks::{ExecutionHooks, RetryEvent, StepCompleted, WaitRequest};
use crate::resources::ResourceMap;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn single(state: Value) -> Value {
    json!({ "StartAt": "S", "States": { "S": state } })
}

fn failure(result: Result<Value, RunError>) -> ErrorOutput {
    match result {
        Err(RunError::Failed(error)) => error,
        other => panic!("expected a catchable failure, got {other:?}"),
    }
}

fn fixed_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap()
}

/// Records hook calls without sleeping.
#[derive(Default, Clone)]
struct Recorder {
    waits: Arc<Mutex<Vec<WaitRequest>>>,
    steps: Arc<Mutex<Vec<StepCompleted>>>,
    reject_heartbeat: bool,
    reject_credentials: bool,
}

impl ExecutionHooks for Recorder {
    fn on_step_complete<'a>(&'a self, step: &'a StepCompleted) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.steps.lock().unwrap().push(step.clone()) })
    }

    fn on_wait(&self, request: WaitRequest) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.waits.lock().unwrap().push(request) })
    }

    fn on_heartbeat_seconds<'a>(&'a self, _state_name: &'a str, _seconds: u64) -> BoxFuture<'a, bool> {
        let accept = !self.reject_heartbeat;
        Box::pin(async move { accept })
    }

    fn on_credentials<'a>(&'a self, _state_name: &'a str, _credentials: &'a Value) -> BoxFuture<'a, bool> {
        let accept = !self.reject_credentials;
        Box::pin(async move { accept })
    }
}

/// Overrides every retry decision with a fixed answer.
struct RetryVerdict(bool);

impl ExecutionHooks for RetryVerdict {
    fn on_retry<'a>(&'a self, _event: &'a RetryEvent) -> BoxFuture<'a, bool> {
        let verdict = self.0;
        Box::pin(async move { verdict })
    }
}

/// Fails with `code` on the first call, then returns "ok".
fn fails_once(code: &'static str, calls: &Arc<AtomicU32>) -> ResourceMap {
    let counter = Arc::clone(calls);
    ResourceMap::new().with("once", move |_input: Value| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Err(ErrorOutput::new(code, None))
            } else {
                Ok(json!("ok"))
            }
        }
    })
}

fn doubler() -> ResourceMap {
    ResourceMap::new().with("double", |input: Value| async move {
        Ok::<_, ErrorOutput>(json!(input.as_i64().unwrap_or(0) * 2))
    })
}

// ---------------------------------------------------------------------------
// Basic flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pass_without_fields_returns_input() {
    let doc = single(json!({ "Type": "Pass", "End": true }));
    let output = run(&doc, ResourceMap::new(), RunOptions::new(json!({ "a": 1 })))
        .await
        .unwrap();
    assert_eq!(output, json!({ "a": 1 }));
}

#[tokio::test]
async fn task_result_merges_at_result_path() {
    let resources = ResourceMap::new().with("sum", |input: Value| async move {
        let total: i64 = input
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_i64).sum())
            .unwrap_or(0);
        Ok::<_, ErrorOutput>(json!(total))
    });
    let doc = single(json!({
        "Type": "Task", "Resource": "sum", "End": true,
        "InputPath": "$.master.detail",
        "ResultPath": "$.master.result.sum"
    }));
    let input = json!({ "master": { "detail": [1, 2, 3] } });
    let output = run(&doc, resources, RunOptions::new(input)).await.unwrap();
    assert_eq!(
        output,
        json!({ "master": { "detail": [1, 2, 3], "result": { "sum": 6 } } })
    );
}

#[tokio::test]
async fn states_chain_through_next() {
    let doc = json!({
        "StartAt": "Double",
        "States": {
            "Double": { "Type": "Task", "Resource": "double", "Next": "Again" },
            "Again": { "Type": "Task", "Resource": "double", "Next": "Done" },
            "Done": { "Type": "Succeed" }
        }
    });
    let output = run(&doc, doubler(), RunOptions::new(json!(3))).await.unwrap();
    assert_eq!(output, json!(12));
}

#[tokio::test]
async fn choice_routes_to_first_match_and_default() {
    let doc = json!({
        "StartAt": "Route",
        "States": {
            "Route": {
                "Type": "Choice",
                "Choices": [
                    { "Variable": "$.n", "NumericGreaterThan": 10, "Next": "Big" },
                    { "Variable": "$.n", "NumericGreaterThan": 5, "Next": "Medium" }
                ],
                "Default": "Small"
            },
            "Big": { "Type": "Pass", "Result": "big", "End": true },
            "Medium": { "Type": "Pass", "Result": "medium", "End": true },
            "Small": { "Type": "Pass", "Result": "small", "End": true }
        }
    });
    for (n, expected) in [(20, "big"), (7, "medium"), (1, "small")] {
        let output = run(&doc, ResourceMap::new(), RunOptions::new(json!({ "n": n })))
            .await
            .unwrap();
        assert_eq!(output, json!(expected));
    }
}

#[tokio::test]
async fn choice_without_match_or_default_fails() {
    let doc = json!({
        "StartAt": "Route",
        "States": {
            "Route": {
                "Type": "Choice",
                "Choices": [{ "Variable": "$.n", "NumericEquals": 1, "Next": "One" }]
            },
            "One": { "Type": "Succeed" }
        }
    });
    let error = failure(run(&doc, ResourceMap::new(), RunOptions::new(json!({ "n": 2 }))).await);
    assert!(error.is(ReservedError::NoChoiceMatched));
}

#[tokio::test]
async fn fail_state_reports_error_and_cause() {
    let doc = single(json!({ "Type": "Fail", "Error": "Custom.Error", "CausePath": "$.why" }));
    let error = failure(run(&doc, ResourceMap::new(), RunOptions::new(json!({ "why": "bad input" }))).await);
    assert_eq!(error.error, "Custom.Error");
    assert_eq!(error.cause.as_deref(), Some("bad input"));
}

#[tokio::test]
async fn unknown_resource_is_not_catchable() {
    let doc = single(json!({
        "Type": "Task", "Resource": "missing", "End": true,
        "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "S" }]
    }));
    let result = run(&doc, ResourceMap::new(), RunOptions::default()).await;
    assert!(matches!(result, Err(RunError::UnknownResource(uri)) if uri == "missing"));
}

#[tokio::test]
async fn context_object_exposes_state_and_caller_values() {
    let doc = single(json!({
        "Type": "Pass", "End": true,
        "Parameters": { "state.$": "$$.State.Name", "execution.$": "$$.Execution.Name", "retries.$": "$$.State.RetryCount" }
    }));
    let options = RunOptions::new(json!({})).with_context_object(json!({ "Execution": { "Name": "nightly" } }));
    let output = run(&doc, ResourceMap::new(), options).await.unwrap();
    assert_eq!(output, json!({ "state": "S", "execution": "nightly", "retries": 0 }));
}

#[tokio::test]
async fn transition_limit_stops_runaway_loops() {
    let doc = json!({
        "StartAt": "A",
        "States": {
            "A": { "Type": "Pass", "Next": "B" },
            "B": { "Type": "Pass", "Next": "A" }
        }
    });
    let config = EngineConfig {
        max_transitions: 10,
        ..EngineConfig::default()
    };
    let result = run(&doc, ResourceMap::new(), RunOptions::default().with_config(config)).await;
    assert!(matches!(result, Err(RunError::TransitionLimitExceeded { limit: 10 })));
}

// ---------------------------------------------------------------------------
// Retry / Catch / timeouts
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retry_then_catch_runs_handler_twice() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let resources = ResourceMap::new().with("flaky", move |_input: Value| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<Value, _>(ErrorOutput::new("Boom", Some("always".to_string()))) }
    });
    let doc = json!({
        "StartAt": "Call",
        "States": {
            "Call": {
                "Type": "Task", "Resource": "flaky", "Next": "Done",
                "Retry": [{ "ErrorEquals": ["Boom"], "MaxAttempts": 1, "IntervalSeconds": 2 }],
                "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Recovered", "ResultPath": "$.error" }]
            },
            "Recovered": { "Type": "Pass", "End": true },
            "Done": { "Type": "Succeed" }
        }
    });
    let started = tokio::time::Instant::now();
    let output = run(&doc, resources, RunOptions::new(json!({ "id": 7 }))).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(
        output,
        json!({ "id": 7, "error": { "Error": "Boom", "Cause": "always" } })
    );
}

#[tokio::test(start_paused = true)]
async fn task_timeout_raises_states_timeout() {
    let resources = ResourceMap::new().with("slow", |_input: Value| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, ErrorOutput>(json!("late"))
    });
    let doc = single(json!({
        "Type": "Task", "Resource": "slow", "End": true, "TimeoutSeconds": 1,
        "Catch": [{ "ErrorEquals": ["States.TaskFailed"], "Next": "S" }]
    }));
    let error = failure(run(&doc, resources, RunOptions::default()).await);
    assert!(error.is(ReservedError::Timeout));
}

#[tokio::test(start_paused = true)]
async fn machine_timeout_bounds_the_run() {
    let doc = json!({
        "StartAt": "W",
        "TimeoutSeconds": 5,
        "States": { "W": { "Type": "Wait", "Seconds": 60, "End": true } }
    });
    let error = failure(run(&doc, ResourceMap::new(), RunOptions::default()).await);
    assert!(error.is(ReservedError::Timeout));
}

#[tokio::test]
async fn rejected_heartbeat_fails_the_task() {
    let doc = single(json!({
        "Type": "Task", "Resource": "double", "End": true, "HeartbeatSeconds": 5
    }));
    let hooks = Recorder {
        reject_heartbeat: true,
        ..Recorder::default()
    };
    let error = failure(run(&doc, doubler(), RunOptions::new(json!(1)).with_hooks(hooks)).await);
    assert!(error.is(ReservedError::HeartbeatTimeout));
}

#[tokio::test]
async fn rejected_credentials_fail_with_permissions() {
    let doc = single(json!({
        "Type": "Task", "Resource": "double", "End": true,
        "Credentials": { "RoleArn": "arn:role/reader" }
    }));
    let hooks = Recorder {
        reject_credentials: true,
        ..Recorder::default()
    };
    let error = failure(run(&doc, doubler(), RunOptions::new(json!(1)).with_hooks(hooks)).await);
    assert!(error.is(ReservedError::Permissions));

    let output = run(&doc, doubler(), RunOptions::new(json!(1)).with_hooks(Recorder::default()))
        .await
        .unwrap();
    assert_eq!(output, json!(2));
}

#[tokio::test]
async fn retry_hook_can_force_a_retry() {
    let calls = Arc::new(AtomicU32::new(0));
    let doc = single(json!({ "Type": "Task", "Resource": "once", "End": true }));
    let options = RunOptions::default().with_hooks(RetryVerdict(true));
    let output = run(&doc, fails_once("Unlisted", &calls), options).await.unwrap();
    assert_eq!(output, json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_hook_can_suppress_a_retry() {
    let calls = Arc::new(AtomicU32::new(0));
    let doc = single(json!({
        "Type": "Task", "Resource": "once", "End": true,
        "Retry": [{ "ErrorEquals": ["Transient"], "MaxAttempts": 3 }]
    }));
    let options = RunOptions::default().with_hooks(RetryVerdict(false));
    let error = failure(run(&doc, fails_once("Transient", &calls), options).await);
    assert_eq!(error.error, "Transient");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Wait
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_seconds_uses_the_run_clock() {
    let hooks = Recorder::default();
    let doc = single(json!({ "Type": "Wait", "SecondsPath": "$.delay", "End": true }));
    let options = RunOptions::new(json!({ "delay": 10 }))
        .with_now_provider(fixed_clock)
        .with_hooks(hooks.clone());
    let output = run(&doc, ResourceMap::new(), options).await.unwrap();
    assert_eq!(output, json!({ "delay": 10 }));

    let waits = hooks.waits.lock().unwrap();
    assert_eq!(waits.len(), 1);
    assert_eq!(waits[0].state_name, "S");
    assert_eq!(waits[0].seconds, Some(10));
    assert_eq!(waits[0].until, fixed_clock() + chrono::Duration::seconds(10));
}

#[tokio::test]
async fn wait_timestamp_is_parsed() {
    let hooks = Recorder::default();
    let doc = single(json!({ "Type": "Wait", "Timestamp": "2024-05-01T13:00:00+01:00", "End": true }));
    let options = RunOptions::default()
        .with_now_provider(fixed_clock)
        .with_hooks(hooks.clone());
    run(&doc, ResourceMap::new(), options).await.unwrap();
    let waits = hooks.waits.lock().unwrap();
    assert_eq!(waits[0].until, fixed_clock());
    assert_eq!(waits[0].seconds, None);
}

#[tokio::test]
async fn invalid_wait_timestamp_is_a_runtime_error() {
    let doc = single(json!({ "Type": "Wait", "TimestampPath": "$.at", "End": true }));
    let options = RunOptions::new(json!({ "at": "tomorrow" })).with_hooks(Recorder::default());
    let error = failure(run(&doc, ResourceMap::new(), options).await);
    assert!(error.is(ReservedError::Runtime));
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

fn sleepy_doubler() -> ResourceMap {
    ResourceMap::new().with("sleepy", |input: Value| async move {
        let n = input.as_u64().unwrap_or(0);
        // Later items finish first.
        tokio::time::sleep(Duration::from_millis(100 - n * 10)).await;
        Ok::<_, ErrorOutput>(json!(n * 2))
    })
}

fn map_over(resource: &str, extra: Value) -> Value {
    let mut state = json!({
        "Type": "Map", "End": true,
        "ItemProcessor": {
            "StartAt": "Work",
            "States": { "Work": { "Type": "Task", "Resource": resource, "End": true } }
        }
    });
    if let (Value::Object(fields), Value::Object(extra)) = (&mut state, extra) {
        fields.extend(extra);
    }
    single(state)
}

#[tokio::test(start_paused = true)]
async fn map_outputs_keep_item_order() {
    let doc = map_over("sleepy", json!({ "MaxConcurrency": 0 }));
    let output = run(&doc, sleepy_doubler(), RunOptions::new(json!([1, 2, 3, 4, 5])))
        .await
        .unwrap();
    assert_eq!(output, json!([2, 4, 6, 8, 10]));
}

#[tokio::test(start_paused = true)]
async fn map_waves_respect_max_concurrency() {
    let doc = map_over("sleepy", json!({ "MaxConcurrency": 2, "ItemsPath": "$.items" }));
    let output = run(&doc, sleepy_doubler(), RunOptions::new(json!({ "items": [1, 2, 3] })))
        .await
        .unwrap();
    assert_eq!(output, json!([2, 4, 6]));
}

fn odd_only() -> ResourceMap {
    ResourceMap::new().with("odd", |input: Value| async move {
        let n = input.as_i64().unwrap_or(0);
        if n % 2 == 0 {
            Err(ErrorOutput::new("Even", Some(format!("{n} is even"))))
        } else {
            Ok(json!(n))
        }
    })
}

#[tokio::test]
async fn map_tolerates_configured_failures() {
    let doc = map_over("odd", json!({ "ToleratedFailureCount": 2 }));
    let output = run(&doc, odd_only(), RunOptions::new(json!([1, 2, 3, 4])))
        .await
        .unwrap();
    assert_eq!(output, json!([1, null, 3, null]));

    let doc = map_over("odd", json!({ "ToleratedFailureCount": 1 }));
    let error = failure(run(&doc, odd_only(), RunOptions::new(json!([1, 2, 3, 4]))).await);
    assert!(error.is(ReservedError::ExceedToleratedFailureThreshold));
}

#[tokio::test]
async fn map_without_tolerance_propagates_item_error() {
    let doc = map_over("odd", json!({}));
    let error = failure(run(&doc, odd_only(), RunOptions::new(json!([1, 2, 3]))).await);
    assert_eq!(error.error, "Even");
}

/// Counts calls to "odd"; even inputs fail.
fn counted_odd_only(calls: &Arc<AtomicU32>) -> ResourceMap {
    let counter = Arc::clone(calls);
    ResourceMap::new().with("odd", move |input: Value| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            match input.as_i64() {
                Some(n) if n % 2 != 0 => Ok(json!(n)),
                _ => Err(ErrorOutput::new("Even", None)),
            }
        }
    })
}

/// Even inputs fail at once; odd inputs finish after ten seconds and bump
/// `finished`.
fn slow_odd_only(finished: &Arc<AtomicU32>) -> ResourceMap {
    let finished = Arc::clone(finished);
    ResourceMap::new().with("slow_odd", move |input: Value| {
        let finished = Arc::clone(&finished);
        async move {
            let n = input.as_i64().unwrap_or(0);
            if n % 2 == 0 {
                return Err(ErrorOutput::new("Boom", None));
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(json!(n))
        }
    })
}

fn cancelling_waves() -> EngineConfig {
    EngineConfig {
        cancel_wave_on_threshold: true,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn map_stops_dispatching_after_threshold() {
    let calls = Arc::new(AtomicU32::new(0));
    let doc = map_over("odd", json!({ "MaxConcurrency": 1, "ToleratedFailureCount": 0 }));
    let error = failure(run(&doc, counted_odd_only(&calls), RunOptions::new(json!([1, 2, 3, 5]))).await);
    assert!(error.is(ReservedError::ExceedToleratedFailureThreshold));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn map_zero_concurrency_runs_one_wave() {
    let calls = Arc::new(AtomicU32::new(0));
    let doc = map_over("odd", json!({ "MaxConcurrency": 0, "ToleratedFailureCount": 0 }));
    let error = failure(run(&doc, counted_odd_only(&calls), RunOptions::new(json!([2, 1, 3, 5]))).await);
    assert!(error.is(ReservedError::ExceedToleratedFailureThreshold));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn failed_map_finishes_its_wave_before_returning() {
    let finished = Arc::new(AtomicU32::new(0));
    let doc = map_over("slow_odd", json!({}));
    let error = failure(run(&doc, slow_odd_only(&finished), RunOptions::new(json!([2, 1, 3]))).await);
    assert_eq!(error.error, "Boom");
    assert_eq!(finished.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelling_policy_aborts_the_wave() {
    let finished = Arc::new(AtomicU32::new(0));
    let options = || RunOptions::new(json!([2, 1, 3])).with_config(cancelling_waves());

    let doc = map_over("slow_odd", json!({ "ToleratedFailureCount": 0 }));
    let error = failure(run(&doc, slow_odd_only(&finished), options()).await);
    assert!(error.is(ReservedError::ExceedToleratedFailureThreshold));

    let doc = map_over("slow_odd", json!({}));
    let error = failure(run(&doc, slow_odd_only(&finished), options()).await);
    assert_eq!(error.error, "Boom");

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn map_tolerance_counts_batched_items() {
    let resources = ResourceMap::new().with("leading_one_fails", |input: Value| async move {
        if input["Items"][0] == json!(1) {
            Err(ErrorOutput::new("BatchFailed", None))
        } else {
            Ok(input["Items"].clone())
        }
    });
    let doc = map_over(
        "leading_one_fails",
        json!({ "ItemBatcher": { "MaxItemsPerBatch": 2 }, "ToleratedFailurePercentage": 50 }),
    );
    let error = failure(run(&doc, resources.clone(), RunOptions::new(json!([1, 2, 3]))).await);
    assert!(error.is(ReservedError::ExceedToleratedFailureThreshold));
    assert!(error.cause.unwrap_or_default().starts_with("2 of 3 items failed"));

    let output = run(&doc, resources, RunOptions::new(json!([3, 5, 1]))).await.unwrap();
    assert_eq!(output, json!([[3, 5], null]));
}

#[tokio::test]
async fn map_batches_items_with_batch_input() {
    let resources = ResourceMap::new().with("count", |input: Value| async move {
        let items = input["Items"].as_array().map(Vec::len).unwrap_or(0);
        Ok::<_, ErrorOutput>(json!({ "n": items, "tag": input["BatchInput"]["tag"] }))
    });
    let doc = map_over(
        "count",
        json!({ "ItemBatcher": { "MaxItemsPerBatch": 2, "BatchInput": { "tag.$": "$.tag" } }, "ItemsPath": "$.items" }),
    );
    let output = run(&doc, resources, RunOptions::new(json!({ "tag": "t", "items": [1, 2, 3] })))
        .await
        .unwrap();
    assert_eq!(output, json!([{ "n": 2, "tag": "t" }, { "n": 1, "tag": "t" }]));
}

#[tokio::test]
async fn map_byte_batching_needs_a_hook() {
    let doc = map_over("double", json!({ "ItemBatcher": { "MaxInputBytesPerBatch": 64 } }));
    let result = run(&doc, doubler(), RunOptions::new(json!([1, 2]))).await;
    assert!(matches!(result, Err(RunError::Configuration(_))));
}

#[tokio::test]
async fn map_reads_items_from_resource() {
    let resources = doubler().with("reader", |_input: Value| async move {
        Ok::<_, ErrorOutput>(json!([1, 2, 3, 4]))
    });
    let doc = map_over(
        "double",
        json!({ "ItemReader": { "Resource": "reader", "ReaderConfig": { "MaxItems": 3 } } }),
    );
    let output = run(&doc, resources, RunOptions::default()).await.unwrap();
    assert_eq!(output, json!([2, 4, 6]));
}

#[tokio::test]
async fn map_reader_failure_is_reported() {
    let resources = doubler().with("reader", |_input: Value| async move {
        Ok::<_, ErrorOutput>(json!({ "not": "an array" }))
    });
    let doc = map_over("double", json!({ "ItemReader": { "Resource": "reader" } }));
    let error = failure(run(&doc, resources, RunOptions::default()).await);
    assert!(error.is(ReservedError::ItemReaderFailed));
}

#[tokio::test]
async fn map_result_writer_failures_aggregate() {
    let resources = doubler().with("writer", |input: Value| async move {
        if input.as_i64() == Some(4) {
            Err(ErrorOutput::new("WriteFailed", None))
        } else {
            Ok(json!({ "stored": input }))
        }
    });
    let doc = map_over("double", json!({ "ResultWriter": { "Resource": "writer" } }));
    let output = run(&doc, resources.clone(), RunOptions::new(json!([1, 3]))).await.unwrap();
    assert_eq!(output, json!([{ "stored": 2 }, { "stored": 6 }]));

    let error = failure(run(&doc, resources, RunOptions::new(json!([1, 2, 3]))).await);
    assert!(error.is(ReservedError::ResultWriterFailed));
    assert!(error.cause.unwrap_or_default().starts_with("1 of 3 writes failed"));
}

#[tokio::test]
async fn map_item_variables_do_not_leak() {
    let hooks = Recorder::default();
    let doc = json!({
        "StartAt": "Init",
        "States": {
            "Init": { "Type": "Pass", "Assign": { "label": "outer" }, "Next": "Each" },
            "Each": {
                "Type": "Map", "Next": "Report",
                "ItemProcessor": {
                    "StartAt": "Inner",
                    "States": {
                        "Inner": {
                            "Type": "Pass", "End": true,
                            "Assign": { "label": "inner" },
                            "Parameters": { "seen.$": "$label" }
                        }
                    }
                }
            },
            "Report": { "Type": "Pass", "End": true, "Parameters": { "items.$": "$", "label.$": "$label" } }
        }
    });
    let output = run(&doc, ResourceMap::new(), RunOptions::new(json!([1, 2])).with_hooks(hooks.clone()))
        .await
        .unwrap();
    assert_eq!(
        output,
        json!({ "items": [{ "seen": "outer" }, { "seen": "outer" }], "label": "outer" })
    );

    let steps = hooks.steps.lock().unwrap();
    let inner: Vec<_> = steps.iter().filter(|s| s.state_name == "Inner").collect();
    assert_eq!(inner.len(), 2);
    assert!(inner.iter().all(|s| s.call_stack == vec!["Each".to_string()]));
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

fn branch(state: Value) -> Value {
    json!({ "StartAt": "B", "States": { "B": state } })
}

#[tokio::test]
async fn parallel_outputs_follow_branch_order() {
    let doc = single(json!({
        "Type": "Parallel", "End": true,
        "Branches": [
            branch(json!({ "Type": "Task", "Resource": "double", "End": true })),
            branch(json!({ "Type": "Pass", "Result": "fixed", "End": true }))
        ]
    }));
    let output = run(&doc, doubler(), RunOptions::new(json!(21))).await.unwrap();
    assert_eq!(output, json!([42, "fixed"]));
}

#[tokio::test]
async fn parallel_branch_failure_names_the_branch() {
    let doc = single(json!({
        "Type": "Parallel", "End": true,
        "Branches": [
            branch(json!({ "Type": "Pass", "End": true })),
            branch(json!({ "Type": "Fail", "Error": "Broken", "Cause": "on purpose" }))
        ]
    }));
    let error = failure(run(&doc, ResourceMap::new(), RunOptions::default()).await);
    assert!(error.is(ReservedError::BranchFailed));
    assert!(error.cause.unwrap_or_default().starts_with("branch 1 failed: Broken"));
}

#[tokio::test(start_paused = true)]
async fn failed_parallel_aborts_sibling_branches() {
    let finished = Arc::new(AtomicU32::new(0));
    let doc = single(json!({
        "Type": "Parallel", "End": true,
        "Branches": [
            branch(json!({ "Type": "Fail", "Error": "Boom" })),
            branch(json!({ "Type": "Task", "Resource": "slow_odd", "End": true }))
        ]
    }));
    let error = failure(run(&doc, slow_odd_only(&finished), RunOptions::new(json!(1))).await);
    assert!(error.is(ReservedError::BranchFailed));
    assert!(error.cause.unwrap_or_default().starts_with("branch 0 failed: Boom"));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn parallel_retries_each_branch() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let resources = ResourceMap::new().with("once", move |_input: Value| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Err(ErrorOutput::new("Transient", None))
            } else {
                Ok(json!("ok"))
            }
        }
    });
    let doc = single(json!({
        "Type": "Parallel", "End": true,
        "Retry": [{ "ErrorEquals": ["Transient"], "MaxAttempts": 2 }],
        "Branches": [branch(json!({ "Type": "Task", "Resource": "once", "End": true }))]
    }));
    let output = run(&doc, resources, RunOptions::default()).await.unwrap();
    assert_eq!(output, json!(["ok"]));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Functional dialect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn functional_dialect_end_to_end() {
    let doc = json!({
        "QueryLanguage": "JSONata",
        "StartAt": "Double",
        "States": {
            "Double": {
                "Type": "Task", "Resource": "double", "Next": "Check",
                "Arguments": "{% states.input.n %}",
                "Assign": { "doubled": "{% states.result %}" },
                "Output": { "value": "{% states.result %}" }
            },
            "Check": {
                "Type": "Choice",
                "Choices": [{ "Condition": "{% states.input.value > 10 %}", "Next": "Big" }],
                "Default": "Small"
            },
            "Big": { "Type": "Pass", "End": true, "Output": { "size": "big", "n": "{% doubled %}" } },
            "Small": { "Type": "Pass", "End": true, "Output": { "size": "small", "n": "{% doubled %}" } }
        }
    });
    let output = run(&doc, doubler(), RunOptions::new(json!({ "n": 8 }))).await.unwrap();
    assert_eq!(output, json!({ "size": "big", "n": 16 }));

    let output = run(&doc, doubler(), RunOptions::new(json!({ "n": 2 }))).await.unwrap();
    assert_eq!(output, json!({ "size": "small", "n": 4 }));
}

#[tokio::test]
async fn functional_evaluation_error_is_catchable() {
    let doc = json!({
        "QueryLanguage": "JSONata",
        "StartAt": "Parse",
        "States": {
            "Parse": {
                "Type": "Task", "Resource": "double", "End": true,
                "Arguments": "{% states.input.word|number %}",
                "Catch": [{ "ErrorEquals": ["States.QueryEvaluationError"], "Next": "Recovered" }]
            },
            "Recovered": { "Type": "Pass", "End": true }
        }
    });
    let output = run(&doc, doubler(), RunOptions::new(json!({ "word": "seven" })))
        .await
        .unwrap();
    assert_eq!(output["Error"], json!("States.QueryEvaluationError"));

    let output = run(&doc, doubler(), RunOptions::new(json!({ "word": "7" }))).await.unwrap();
    assert_eq!(output, json!(14));
}

#[tokio::test]
async fn default_query_language_applies_to_undeclared_machines() {
    let doc = single(json!({ "Type": "Pass", "End": true, "Output": "{% states.input.a + 1 %}" }));
    let options = RunOptions::new(json!({ "a": 1 })).with_query_language(QueryLanguage::Functional);
    let output = run(&doc, ResourceMap::new(), options).await.unwrap();
    assert_eq!(output, json!(2));
}

#[tokio::test]
async fn interpreter_reuses_a_loaded_machine() {
    let machine = crate::definition::load_definition(
        r#"{ "StartAt": "S", "States": { "S": { "Type": "Task", "Resource": "double", "End": true } } }"#,
    )
    .unwrap();
    let interpreter = Interpreter::new(machine, doubler());
    for n in 1..=3 {
        let output = interpreter.run(RunOptions::new(json!(n))).await.unwrap();
        assert_eq!(output, json!(n * 2));
    }
}
