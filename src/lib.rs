//! MCP Channel - host-side bridge to an MCP worker process
//!
//! Spawns the worker (by default `node mcp_bridge.js`), talks to it with
//! newline-delimited JSON over its stdio, correlates responses with the
//! requests that caused them, and forwards unsolicited events to a single
//! subscriber.

pub mod commands;
pub mod config;
pub mod session;
pub mod stdio;
pub mod worker;

mod error;
mod utils;

pub use error::{Error, Result, SendError};
pub use session::{PendingResponse, Session, SessionState};

/// Install the stderr log subscriber used by the binary
///
/// `RUST_LOG` overrides the default `mcp_channel=debug` filter.
pub fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mcp_channel=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to init tracing: {}", e)))
}
