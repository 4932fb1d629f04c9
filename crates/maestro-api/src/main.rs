//! Maestro CLI entry point.
//!
//! Binary name: `maestro`
//!
//! Parses CLI arguments, sets up tracing, resolves the data directory and
//! engine config, then dispatches to the command handlers.

mod cli;
mod dry_run;
mod state;

use clap::Parser;
use clap_complete::generate;
use maestro_observe::{LogFormat, TracingOptions};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let tracing_options = TracingOptions {
        verbosity: cli.verbose,
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        otel: cli.otel,
    };
    maestro_observe::init_tracing(&tracing_options)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "maestro", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let result = cli::dispatch(cli.command, &state, cli.json).await;

    maestro_observe::shutdown_tracing();
    result
}
