//! `mcp-channel` binary
//!
//! Drives one session from JSON lines on stdin; replies and worker events are
//! written to stdout, logs to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use mcp_channel::config::{read_config, read_config_from_path};
use mcp_channel::{Error, Result, Session};

#[derive(Debug, Parser)]
#[command(name = "mcp-channel", about = "Bridge to an MCP worker process", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker script, overriding the configured one
    #[arg(long)]
    script: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    mcp_channel::init_tracing()?;
    tracing::info!("Starting mcp-channel");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("Failed to build tokio runtime: {}", e)))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => read_config_from_path(path)?,
        None => read_config()?,
    };

    if let Some(script) = args.script {
        config.worker.script = Some(script);
    }

    let session = Arc::new(Session::new(config));
    mcp_channel::stdio::serve(session, tokio::io::stdin(), tokio::io::stdout()).await?;

    tracing::info!("mcp-channel shut down");
    Ok(())
}
