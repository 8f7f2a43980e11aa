//! Single-threaded relay runtime.
//!
//! - `token`: connection handles and poll tokens
//! - `protocol`: incremental parser and frame encoders
//! - `connection`: per-connection buffers and the connection registry
//! - `router`: forwarding of messages between registered users
//! - `event_loop`: the mio poll loop that drives everything

pub mod connection;
pub mod event_loop;
pub mod protocol;
pub mod router;
pub mod token;

pub use event_loop::Server;

use crate::config::Config;

/// Bind and serve until the process is stopped.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut server = Server::bind(config)?;
    server.run()
}
