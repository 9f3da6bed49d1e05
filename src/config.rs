//! Channel configuration
//!
//! Parses `<config dir>/mcp-channel/config.toml`. Every field is optional; a
//! missing file means defaults (`node mcp_bridge.js` next to the executable).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::utils;
use crate::worker::LaunchSpec;
use crate::{Error, Result};

/// Default bound on how long a request may stay pending
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Worker launch settings
    pub worker: WorkerConfig,

    /// Request timeout in milliseconds; `0` waits forever
    pub request_timeout_ms: u64,

    /// Wait for the worker's reply to `initialize` before reporting success
    pub await_initialize_ack: bool,

    /// Capability map returned by `getCapabilities`
    pub capabilities: Option<JsonValue>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            await_initialize_ack: false,
            capabilities: None,
        }
    }
}

impl ChannelConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn capabilities(&self) -> JsonValue {
        self.capabilities
            .clone()
            .unwrap_or_else(default_capabilities)
    }
}

/// How to launch the worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program to run, looked up in PATH
    pub program: String,

    /// Script passed as the first argument; an empty path means none
    pub script: Option<PathBuf>,

    /// Extra arguments after the script
    pub args: Vec<String>,

    /// Working directory; defaults to the executable's directory
    pub working_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            script: utils::default_script_path().ok(),
            args: Vec::new(),
            working_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Run `program` with `args` and no script
    pub fn command<S: Into<String>>(program: S, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            script: None,
            args,
            working_dir: None,
        }
    }

    /// Resolve the program and script into a spawnable command line
    pub fn launch_spec(&self) -> Result<LaunchSpec> {
        let mut args = Vec::with_capacity(self.args.len() + 1);

        if let Some(script) = self.script.as_ref().filter(|s| !s.as_os_str().is_empty()) {
            let script = utils::validate_and_canonicalize_path(script)?;
            args.push(script.to_string_lossy().into_owned());
        }
        args.extend(self.args.iter().cloned());

        let working_dir = match &self.working_dir {
            Some(dir) => Some(dir.clone()),
            None => utils::exe_dir().ok(),
        };

        Ok(LaunchSpec {
            program: utils::resolve_program(&self.program),
            args,
            working_dir,
        })
    }
}

/// Capabilities reported when none are configured
pub fn default_capabilities() -> JsonValue {
    serde_json::json!({
        "filesystem": {
            "tools": ["read_file", "write_file", "list_directory"],
            "resources": ["files"],
            "supportsProgress": true,
            "supportsCancel": false
        }
    })
}

/// Default configuration file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("mcp-channel"))
        .unwrap_or_else(|| PathBuf::from(".mcp-channel"))
        .join("config.toml")
}

/// Read the configuration from the default location
pub fn read_config() -> Result<ChannelConfig> {
    let config_path = default_config_path();

    if !config_path.exists() {
        tracing::warn!("Config not found at {:?}, using defaults", config_path);
        return Ok(ChannelConfig::default());
    }

    read_config_from_path(&config_path)
}

/// Read configuration from a specific path
pub fn read_config_from_path(path: &Path) -> Result<ChannelConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {:?}: {}", path, e)))?;

    let config: ChannelConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config {:?}: {}", path, e)))?;

    tracing::debug!("Loaded config from {:?} (worker: {})", path, config.worker.program);

    Ok(config)
}
