//! Execution engine for statelang state machines.
//!
//! This crate evaluates the two query dialects (path expressions with
//! intrinsic functions, and `{% %}` functional expressions), applies the
//! per-state I/O pipeline and Retry/Catch policy, and walks state graphs
//! including concurrent Map and Parallel states. It depends only on
//! `statelang-types` for the definition model; resources and hooks are
//! supplied by the caller.

pub mod choice;
pub mod definition;
pub mod engine;
pub mod error;
pub mod functional;
pub mod hooks;
pub mod intrinsics;
pub mod path;
pub mod pipeline;
pub mod policy;
pub mod resources;
pub mod scope;
pub mod template;

pub use definition::{load_definition, load_value};
pub use engine::{Interpreter, NowProvider, RunOptions, run};
pub use error::RunError;
pub use hooks::{DefaultHooks, ExecutionHooks};
pub use resources::{ResourceMap, ResourceResolver, TaskHandler};
