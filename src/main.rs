//! quantum-session - MQTT client entrypoint.
//!
//! Usage:
//!   quantum-session subscribe --host broker --topic 'sensors/#'
//!   quantum-session publish --topic sensors/1 --message 21.5
//!   echo 'sensors/1:21.5' | quantum-session publish

use anyhow::Result;
use clap::Parser;
use quantum_session::cli::commands::{run_publish, run_subscribe};
use quantum_session::cli::{Cli, Commands};
use quantum_session::ops::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(Some(&cli.log_level), cli.log_format.into())?;
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Subscribe(args) => run_subscribe(config, args).await,
        Commands::Publish(args) => run_publish(config, args).await,
    }
}
