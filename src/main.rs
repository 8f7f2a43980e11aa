//! line-relay: a single-threaded TCP message relay
//!
//! Clients register a user name, then send newline-delimited messages
//! addressed to other users; the server forwards each message to the
//! recipient's live connection.
//!
//! Features:
//! - One mio event loop multiplexing every client socket
//! - Incremental parsing of fragmented input
//! - Bounded frames and bounded per-recipient output
//! - Configuration via CLI arguments or TOML file
//! - A small interactive client

mod client;
mod config;
mod runtime;

use config::Launch;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let launch = Launch::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(launch.log_level()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match launch {
        Launch::Server(config) => {
            info!(
                listen = %config.listen,
                max_connections = config.max_connections,
                max_frame_size = config.max_frame_size,
                "Starting line-relay server"
            );
            runtime::run(config)?;
            Ok(())
        }
        Launch::Client(config) => client::run(config),
    }
}
