//! Caller-supplied execution hooks.
//!
//! The engine decides *when* something happens and calls out to these hooks
//! to decide *how*: waiting, observing completed steps, overriding retries,
//! and approving heartbeat or credential settings. Every method has a default,
//! so `DefaultHooks` is a complete implementation.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use statelang_types::error::ErrorOutput;

// ---------------------------------------------------------------------------
// Hook payloads
// ---------------------------------------------------------------------------

/// A state finished (successfully or through a catcher).
#[derive(Debug, Clone)]
pub struct StepCompleted {
    pub state_name: String,
    pub state_type: &'static str,
    pub input: Value,
    pub output: Value,
    /// State names from the root graph down to this one, for nested Map and
    /// Parallel invocations.
    pub call_stack: Vec<String>,
}

/// A failure matched (or failed to match) a retrier.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub state_name: String,
    pub error: ErrorOutput,
    /// 1-based number of the retry that would run.
    pub attempt: u32,
    /// The retry policy's own decision.
    pub would_retry: bool,
    pub delay: std::time::Duration,
}

/// A Wait state wants to resume at `until`.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitRequest {
    pub state_name: String,
    pub until: DateTime<Utc>,
    /// Set when the wait was given in seconds rather than as a timestamp.
    pub seconds: Option<u64>,
    /// The clock reading the resume instant was computed from.
    pub now: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ExecutionHooks
// ---------------------------------------------------------------------------

pub trait ExecutionHooks: Send + Sync {
    fn on_step_complete<'a>(&'a self, _step: &'a StepCompleted) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// Return whether to retry. The default accepts the policy's decision.
    fn on_retry<'a>(&'a self, event: &'a RetryEvent) -> BoxFuture<'a, bool> {
        Box::pin(async move { event.would_retry })
    }

    /// Suspend until the wait is over. The default sleeps on the tokio clock
    /// for the remaining time.
    fn on_wait(&self, request: WaitRequest) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let remaining = (request.until - request.now).to_std().unwrap_or_default();
            tokio::time::sleep(remaining).await;
        })
    }

    /// Approve a Task's `HeartbeatSeconds`; `false` fails the Task with
    /// `States.HeartbeatTimeout`.
    fn on_heartbeat_seconds<'a>(&'a self, _state_name: &'a str, _seconds: u64) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }

    /// Approve a Task's `Credentials`; `false` fails the Task with
    /// `States.Permissions`.
    fn on_credentials<'a>(&'a self, _state_name: &'a str, _credentials: &'a Value) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }

    /// Split Map items into batches of at most `max_bytes` serialized bytes.
    /// `None` means byte batching is unsupported, which fails the run with a
    /// configuration error when a Map asks for it.
    fn on_max_input_bytes_per_batch<'a>(
        &'a self,
        _state_name: &'a str,
        _items: &'a [Value],
        _max_bytes: u64,
    ) -> BoxFuture<'a, Option<Vec<Vec<Value>>>> {
        Box::pin(async { None })
    }
}

/// Hooks that keep every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ExecutionHooks for DefaultHooks {}

/// Greedy batching by serialized JSON size. An item larger than `max_bytes`
/// gets a batch of its own.
pub fn split_by_bytes(items: &[Value], max_bytes: u64) -> Vec<Vec<Value>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = 0u64;
    for item in items {
        let item_size = item.to_string().len() as u64;
        if !current.is_empty() && size + item_size > max_bytes {
            batches.push(std::mem::take(&mut current));
            size = 0;
        }
        size += item_size;
        current.push(item.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
