//! Error types for the MCP channel

use std::time::Duration;

use serde::ser::SerializeMap;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Failure to write an envelope to the worker's stdin
#[derive(Error, Debug)]
pub enum SendError {
    #[error("worker process is not running")]
    NotRunning,

    #[error("write to worker stdin failed: {0}")]
    WriteFailed(#[source] std::io::Error),
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to start worker process: {0}")]
    Start(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("MCP not initialized")]
    NotInitialized,

    #[error("Request ID is required")]
    MissingRequestId,

    #[error("Request ID already pending: {0}")]
    DuplicateRequestId(String),

    #[error("Failed to send message to MCP process: {0}")]
    SendFailed(#[from] SendError),

    #[error("Worker reported an error")]
    Remote(JsonValue),

    #[error("Malformed message from worker: {0}")]
    MalformedMessage(String),

    #[error("Worker process died: {0}")]
    ProcessDied(String),

    #[error("Session disposed")]
    SessionDisposed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Method not implemented: {0}")]
    NotImplemented(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable error code reported to the host
    pub fn code(&self) -> &'static str {
        match self {
            Error::Start(_) | Error::InitializationFailed(_) => "INITIALIZATION_FAILED",
            Error::NotInitialized => "NOT_INITIALIZED",
            Error::MissingRequestId => "MISSING_REQUEST_ID",
            Error::DuplicateRequestId(_) => "DUPLICATE_REQUEST_ID",
            Error::SendFailed(_) => "SEND_FAILED",
            Error::Remote(_) => "MCP_ERROR",
            Error::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Error::ProcessDied(_) => "PROCESS_DIED",
            Error::SessionDisposed => "SESSION_DISPOSED",
            Error::Timeout(_) => "TIMEOUT",
            Error::InvalidArguments(_) => "INVALID_ARGUMENTS",
            Error::NotImplemented(_) => "NOT_IMPLEMENTED",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Other(_) => "INTERNAL",
        }
    }
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

// Host-facing shape: {"code": ..., "message": ..., "details"?: ...}
impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let details = match self {
            Error::Remote(payload) => Some(payload),
            _ => None,
        };

        let mut map = serializer.serialize_map(Some(if details.is_some() { 3 } else { 2 }))?;
        map.serialize_entry("code", self.code())?;
        map.serialize_entry("message", &self.to_string())?;
        if let Some(details) = details {
            map.serialize_entry("details", details)?;
        }
        map.end()
    }
}
