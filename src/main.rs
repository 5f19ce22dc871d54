//! Kolosal PNAS - Main Entry Point
//!
//! Progressive neural architecture search from the command line.

use clap::Parser;
use kolosal_pnas::cli::{cmd_demo, cmd_search, cmd_space, Cli, Commands};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kolosal_pnas=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Search(args) => {
            cmd_search(&args)?;
        }
        Commands::Space { config, blocks, top_k } => {
            cmd_space(config.as_deref(), blocks, top_k)?;
        }
        Commands::Demo { blocks, top_k, seed, history } => {
            cmd_demo(blocks, top_k, seed, &history)?;
        }
    }

    Ok(())
}
