mod capture;
mod cmd;
mod protocol;
mod reassembly;
mod stats;
mod stream;

use clap::Parser;
use tracing::{error, Level};
use tracing_subscriber::EnvFilter;

use cmd::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(
                    cli.log_level
                        .parse()
                        .unwrap_or_else(|_| Level::INFO.into()),
                )
                .from_env_lossy(),
        )
        .init();

    let result = match cli.command {
        Command::Replay(args) => cmd::replay::run(args).await,
    };

    if let Err(e) = result {
        error!(error = %e, "command exit with error");
        std::process::exit(1);
    }
}
