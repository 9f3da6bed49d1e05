//! Session method dispatch

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::session::Session;
use crate::{Error, Result};

/// One method invocation from the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCall {
    pub method: String,
    #[serde(default)]
    pub arguments: JsonValue,
}

impl HostCall {
    pub fn new<S: Into<String>>(method: S, arguments: JsonValue) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Run `call` against `session`.
///
/// `processMessage` waits for the worker's reply; every other method returns
/// as soon as the session has acted.
pub async fn dispatch(session: &Session, call: HostCall) -> Result<JsonValue> {
    if !call.arguments.is_object() {
        return Err(Error::InvalidArguments(
            "Arguments must be a map".to_string(),
        ));
    }

    tracing::debug!("Host call: {}", call.method);

    match call.method.as_str() {
        "initialize" => session.initialize(call.arguments).await,
        "processMessage" => session.process_message(call.arguments).await?.wait().await,
        "streamMessage" => session.stream_message(call.arguments).await,
        "testConnection" => session.test_connection().await,
        "getCapabilities" => session.get_capabilities(),
        "injectContext" => session.inject_context(call.arguments).await,
        "dispose" => session.dispose().await,
        other => Err(Error::NotImplemented(other.to_string())),
    }
}
