use clap::Parser;
use std::process;
use tracing::error;

use nexa_orchestrator::cli::{Cli, CliHandler};
use nexa_orchestrator::logging::{self, LogOptions};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let options = LogOptions {
        level: cli.log_level.clone(),
        log_dir: cli.log_dir.clone(),
        ..LogOptions::default()
    };
    if let Err(e) = logging::init(options) {
        eprintln!("Failed to initialise logging: {}", e);
        process::exit(1);
    }

    let handler = CliHandler::new();
    if let Err(e) = handler.handle(cli.command).await {
        error!("{:#}", e);
        process::exit(1);
    }
}
