//! CLI command definitions for the `statelang` binary.

pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

/// Run and validate States Language state machines.
#[derive(Parser)]
#[command(name = "statelang", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a state machine definition.
    Run(RunArgs),

    /// Load a definition and report structural errors.
    Validate {
        /// Path to the definition JSON file.
        definition: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the definition JSON file.
    pub definition: PathBuf,

    /// Execution input as a JSON string.
    #[arg(long, conflicts_with = "input_file")]
    pub input: Option<String>,

    /// Read the execution input from a JSON file.
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// TOML file mapping resource URIs to commands or fixed results.
    #[arg(long, env = "STATELANG_RESOURCES")]
    pub resources: Option<PathBuf>,

    /// Engine configuration file (defaults to the platform config dir).
    #[arg(long, env = "STATELANG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Return from Wait states immediately instead of sleeping.
    #[arg(long)]
    pub skip_waits: bool,
}
