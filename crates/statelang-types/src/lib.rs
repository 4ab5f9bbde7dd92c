//! Shared domain types for statelang.
//!
//! This crate holds the definition model of the States Language (state
//! machines, states, choice rules, retry/catch policies, Map item sources),
//! the `ErrorOutput` record that flows through Retry/Catch, and the engine
//! configuration record.
//!
//! Zero runtime dependencies -- only serde, serde_json, thiserror.

pub mod choice;
pub mod config;
pub mod definition;
pub mod error;
pub mod map;
pub mod policy;
