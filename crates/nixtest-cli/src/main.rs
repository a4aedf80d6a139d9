//! nixtest CLI - NixOS installation test supervisor.

use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod render;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on debug flag
    let filter = if cli.debug {
        "nixtest=debug,nixtest_core=debug,nixtest_backend=debug,nixtest_cli=debug"
    } else {
        "nixtest=info,nixtest_core=info,nixtest_backend=info,nixtest_cli=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    colored::control::set_override(std::io::stdout().is_terminal());

    let config = commands::load_config(cli.config.as_deref())?;

    let code = match cli.command {
        Commands::Test(args) => commands::test::execute(args, config).await?,
        Commands::Setup(args) => commands::setup::execute(args, config).await?,
        Commands::Cleanup(args) => commands::cleanup::execute(args, config).await?,
        Commands::Status(args) => commands::status::execute(args, config).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
