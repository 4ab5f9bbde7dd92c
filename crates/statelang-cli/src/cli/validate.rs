//! `statelang validate`: load a definition and report what it contains.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use serde_json::json;
use statelang_core::load_definition;
use statelang_types::definition::{State, StateGraph};

pub async fn handle_validate(path: &Path, json_output: bool) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read definition file {}", path.display()))?;
    let machine = load_definition(&text).with_context(|| format!("invalid definition {}", path.display()))?;
    let states = count_states(&machine.graph);

    if json_output {
        let body = json!({
            "valid": true,
            "start_at": machine.graph.start_at,
            "states": states,
            "query_language": machine.query_language.map(|q| q.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!(
            "  {} {} is valid",
            style("*").green().bold(),
            style(path.display()).cyan()
        );
        println!("  Start: {}", style(&machine.graph.start_at).cyan());
        println!("  States: {states} (nested graphs included)");
    }
    Ok(())
}

/// States in a graph and every nested Map/Parallel graph.
fn count_states(graph: &StateGraph) -> usize {
    graph
        .states
        .values()
        .map(|state| {
            1 + match state {
                State::Map(map) => map.processor().map(|g| count_states(g)).unwrap_or(0),
                State::Parallel(parallel) => parallel.branches.iter().map(|g| count_states(g)).sum(),
                _ => 0,
            }
        })
        .sum()
}
