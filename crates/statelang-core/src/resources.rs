//! Resource resolution for Task states, ItemReaders and ResultWriters.
//!
//! A resource URI is mapped to a [`TaskHandler`] by a [`ResourceResolver`].
//! Handlers are object-safe (boxed futures) so a resolver can hand out
//! `Arc<dyn TaskHandler>` values of any concrete type. A blanket
//! implementation lets plain async closures act as handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use statelang_types::error::ErrorOutput;

// ---------------------------------------------------------------------------
// TaskHandler
// ---------------------------------------------------------------------------

/// Performs the effect of a Task state.
///
/// The returned future must be `'static`: a Task that times out is detached
/// and may keep running after the engine stops waiting for it.
pub trait TaskHandler: Send + Sync {
    fn invoke(&self, input: Value) -> BoxFuture<'static, Result<Value, ErrorOutput>>;
}

/// Blanket implementation: any `Fn(Value) -> impl Future<Output = Result<..>>`
/// is a handler.
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ErrorOutput>> + Send + 'static,
{
    fn invoke(&self, input: Value) -> BoxFuture<'static, Result<Value, ErrorOutput>> {
        Box::pin(self(input))
    }
}

// ---------------------------------------------------------------------------
// ResourceResolver
// ---------------------------------------------------------------------------

/// Maps resource URIs to handlers. `None` means the URI is unknown, which
/// fails the run with a configuration error.
pub trait ResourceResolver: Send + Sync {
    fn resolve(&self, resource: &str) -> Option<Arc<dyn TaskHandler>>;
}

/// Resolver functions: `|uri| -> Option<Arc<dyn TaskHandler>>`.
impl<F> ResourceResolver for F
where
    F: Fn(&str) -> Option<Arc<dyn TaskHandler>> + Send + Sync,
{
    fn resolve(&self, resource: &str) -> Option<Arc<dyn TaskHandler>> {
        self(resource)
    }
}

/// Name-to-handler table.
#[derive(Default, Clone)]
pub struct ResourceMap {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same URI.
    pub fn register(&mut self, resource: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.handlers.insert(resource.into(), Arc::new(handler));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, resource: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        self.register(resource, handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl ResourceResolver for ResourceMap {
    fn resolve(&self, resource: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(resource).cloned()
    }
}
