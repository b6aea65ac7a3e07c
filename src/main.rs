//! errlimits: an error-size probing harness
//!
//! Subcommands:
//! - `serve`: answer every call with an error message of the requested size
//! - `probe`: request errors of one size and log the size breakdown
//! - `watch`: keep calling whichever of several servers is reachable
//!
//! Configuration via CLI arguments or TOML file

use errlimits::config::{Config, Mode};
use errlimits::probe;
use errlimits::server::Server;
use errlimits::status::Code;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.mode {
        Mode::Serve(settings) => {
            info!(
                listen = %settings.listen,
                max_error_length = settings.max_error_length,
                max_connections = settings.max_connections,
                "Starting errlimits server"
            );
            Server::new(settings).run().await
        }
        Mode::Probe(settings) => {
            let summary = probe::run_probe(settings).await?;
            info!(
                successes = summary.successes,
                failures = summary.failures.len(),
                "Probe finished"
            );
            Ok(())
        }
        Mode::Watch(settings) => {
            let summary = probe::run_watch(settings).await?;
            info!(
                calls = summary.calls,
                successes = summary.by_code.get(&Code::Ok).copied().unwrap_or(0),
                "Watch finished"
            );
            Ok(())
        }
    }
}
