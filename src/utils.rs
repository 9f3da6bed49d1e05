//! Utility functions for mcp-channel

use std::path::{Path, PathBuf};

use crate::Result;

/// File name of the worker script shipped next to the host executable
pub const DEFAULT_SCRIPT_NAME: &str = "mcp_bridge.js";

/// Directory containing the running host executable
pub fn exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| crate::Error::Config(format!("Executable has no parent directory: {:?}", exe)))
}

/// Default location of the worker script: next to the host executable
pub fn default_script_path() -> Result<PathBuf> {
    Ok(exe_dir()?.join(DEFAULT_SCRIPT_NAME))
}

/// Resolve a program name through PATH, falling back to the name as given
pub fn resolve_program(program: &str) -> PathBuf {
    match which::which(program) {
        Ok(path) => path,
        Err(e) => {
            tracing::debug!("{} not found in PATH ({}), using as given", program, e);
            PathBuf::from(program)
        }
    }
}

/// Validate and canonicalize a path that must exist
pub fn validate_and_canonicalize_path(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|_| {
        crate::Error::Config(format!("Invalid or non-existent path: {}", path.display()))
    })
}
