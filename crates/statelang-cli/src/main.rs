//! statelang command-line entry point.
//!
//! Binary name: `statelang`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the run,
//! validate or completions handler.

mod cli;
mod config;
mod resources;

use clap::Parser;
use clap_complete::generate;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,statelang_core=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("STATELANG_LOG").unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let succeeded = cli::run::handle_run(args, cli.json, cli.quiet).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }

        Commands::Validate { definition } => {
            cli::validate::handle_validate(&definition, cli.json).await?;
        }

        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "statelang", &mut std::io::stdout());
        }
    }

    Ok(())
}
