use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use smidr_daemon::args::{Args, Commands};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Daemon(daemon_args) => {
            if let Err(err) = smidr_daemon::start(daemon_args).await {
                error!(
                    error = &err as &dyn std::error::Error,
                    "daemon exited with an error"
                );
                std::process::exit(1);
            }
        }
    }
}
