//! JSON-lines front end for a session
//!
//! Each input line is a host call, `{"id": any, "method": ..., "arguments": {...}}`.
//! Each output line is either a reply, `{"id", "result"}` or `{"id", "error"}`,
//! or a worker event, `{"event": ...}`. Replies to `processMessage` may arrive
//! out of order; everything else is answered in input order.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::commands::{dispatch, HostCall};
use crate::session::Session;
use crate::worker::codec::LineCodec;
use crate::worker::EventSubscription;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct HostRequest {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(flatten)]
    call: HostCall,
}

/// Serve host calls from `reader` until it closes or fails, then dispose the
/// session and flush the remaining output.
pub async fn serve<R, W>(session: Arc<Session>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outputs, pending_outputs) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_outputs(writer, pending_outputs));

    let mut lines = FramedRead::new(reader, LineCodec::new());

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Error reading host input: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let HostRequest { id, call } = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Invalid host call: {}", e);
                let _ = outputs.send(reply(None, Err(Error::Json(e))));
                continue;
            }
        };

        match call.method.as_str() {
            "initialize" => {
                // Subscribe first so no early event is lost
                forward_events(session.subscribe(), outputs.clone());
            }
            "processMessage" => {
                let session = session.clone();
                let outputs = outputs.clone();
                tokio::spawn(async move {
                    let outcome = dispatch(&session, call).await;
                    let _ = outputs.send(reply(id, outcome));
                });
                continue;
            }
            _ => {}
        }

        let outcome = dispatch(&session, call).await;
        let _ = outputs.send(reply(id, outcome));
    }

    tracing::info!("Host input closed, disposing session");
    let disposed = session.dispose().await;
    drop(outputs);

    writer_task
        .await
        .map_err(|e| Error::Other(format!("Output writer task failed: {}", e)))??;
    disposed.map(|_| ())
}

fn reply(id: Option<JsonValue>, outcome: Result<JsonValue>) -> JsonValue {
    match outcome {
        Ok(result) => json!({ "id": id, "result": result }),
        Err(error) => {
            tracing::debug!("Host call failed: {}", error);
            json!({ "id": id, "error": error })
        }
    }
}

fn forward_events(mut events: EventSubscription, outputs: mpsc::UnboundedSender<JsonValue>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if outputs.send(json!({ "event": event })).is_err() {
                break;
            }
        }
        tracing::debug!("Event subscription {} closed", events.id());
    });
}

async fn write_outputs<W>(writer: W, mut outputs: mpsc::UnboundedReceiver<JsonValue>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, LineCodec::new());

    while let Some(output) = outputs.recv().await {
        framed.send(serde_json::to_string(&output)?).await?;
    }

    Ok(())
}
