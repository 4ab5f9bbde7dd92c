//! Engine configuration.
//!
//! `EngineConfig` is the `config.toml` that tunes interpreter limits and
//! defaults. Every field has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};

use crate::definition::QueryLanguage;

/// Interpreter settings shared by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Dialect for states and machines that do not declare one.
    #[serde(default)]
    pub query_language: QueryLanguage,

    /// Upper bound on state transitions in one execution, nested Map and
    /// Parallel graphs included.
    #[serde(default = "default_max_transitions")]
    pub max_transitions: u64,

    /// Maximum nesting depth of Choice rules.
    #[serde(default = "default_max_choice_depth")]
    pub max_choice_depth: usize,

    /// Element cap for `States.ArrayRange`.
    #[serde(default = "default_max_array_range")]
    pub max_array_range: usize,

    /// When a Map exceeds its failure tolerance, abort the rest of the
    /// running wave instead of letting it finish.
    #[serde(default)]
    pub cancel_wave_on_threshold: bool,

    /// Task timeout applied when a Task declares none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_task_timeout_secs: Option<u64>,
}

fn default_max_transitions() -> u64 {
    25_000
}

fn default_max_choice_depth() -> usize {
    64
}

fn default_max_array_range() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_language: QueryLanguage::default(),
            max_transitions: default_max_transitions(),
            max_choice_depth: default_max_choice_depth(),
            max_array_range: default_max_array_range(),
            cancel_wave_on_threshold: false,
            default_task_timeout_secs: None,
        }
    }
}
