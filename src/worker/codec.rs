//! Wire codec for the worker protocol
//!
//! Outbound envelopes are single-line JSON objects
//! `{"method": ..., "params": ..., "requestId": ...}`. Inbound lines are parsed
//! only far enough to route them: the `type` tag, the `requestId`, and whether
//! an `error` field is set. The payload itself is handed on untouched.

use std::io;

use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{Error, Result};

/// Maximum accepted length of one inbound line: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Outbound request envelope
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestEnvelope<'a, T: Serialize + ?Sized> {
    method: &'a str,
    params: &'a T,
    request_id: &'a str,
}

/// Routing class of an inbound envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Response,
    Event,
    Unknown,
}

/// A decoded inbound envelope
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub kind: MessageKind,
    pub request_id: Option<String>,
    /// `error` present and not `null`
    pub is_error: bool,
    /// The whole parsed envelope, or the raw line as a string if it did not parse
    pub payload: JsonValue,
}

impl InboundMessage {
    fn unknown(line: &str) -> Self {
        Self {
            kind: MessageKind::Unknown,
            request_id: None,
            is_error: false,
            payload: JsonValue::String(line.to_string()),
        }
    }
}

/// Serialize a request envelope to one line of JSON (no trailing newline).
pub fn encode_request<T>(method: &str, params: &T, request_id: &str) -> Result<String>
where
    T: Serialize + ?Sized,
{
    let envelope = RequestEnvelope {
        method,
        params,
        request_id,
    };
    // Compact serde_json output escapes control characters, so it never
    // contains a raw newline.
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode the routing fields of an inbound line.
///
/// Never fails: anything that is not a JSON object with a known `type` comes
/// back as [`MessageKind::Unknown`].
pub fn decode_envelope(line: &str) -> InboundMessage {
    match parse_envelope(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!("{}", e);
            InboundMessage::unknown(line)
        }
    }
}

/// Strict variant of [`decode_envelope`] that reports why a line was rejected.
pub fn parse_envelope(line: &str) -> Result<InboundMessage> {
    let payload: JsonValue = serde_json::from_str(line.trim())
        .map_err(|e| Error::MalformedMessage(format!("{}: {}", e, line)))?;

    let object = payload
        .as_object()
        .ok_or_else(|| Error::MalformedMessage(format!("not a JSON object: {}", line)))?;

    let kind = match object.get("type").and_then(JsonValue::as_str) {
        Some("response") => MessageKind::Response,
        Some("event") => MessageKind::Event,
        _ => MessageKind::Unknown,
    };

    let request_id = match object.get("requestId") {
        Some(JsonValue::String(id)) => Some(id.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    let is_error = object.get("error").is_some_and(|e| !e.is_null());

    Ok(InboundMessage {
        kind,
        request_id,
        is_error,
        payload,
    })
}

/// Newline framing for the worker pipes and the host stdio
///
/// Wraps [`LinesCodec`] with a [`MAX_LINE_BYTES`] ceiling so a worker that never
/// writes a newline cannot make the host buffer without bound. Over-long lines
/// and lines that are not UTF-8 are discarded and reading carries on; partial
/// lines stay in the read buffer until their newline arrives.
#[derive(Debug)]
pub struct LineCodec(LinesCodec);

impl LineCodec {
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        let lines = &mut self.0;
        next_valid_line(|| lines.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        let lines = &mut self.0;
        next_valid_line(|| lines.decode_eof(src))
    }
}

// FramedRead stops after the first decoder error, so unusable lines are
// skipped here instead of surfacing. LinesCodec has already consumed a line
// by the time it rejects it as non-UTF-8.
fn next_valid_line<F>(mut decode: F) -> Result<Option<String>>
where
    F: FnMut() -> std::result::Result<Option<String>, LinesCodecError>,
{
    loop {
        match decode() {
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!("Discarding line longer than {} bytes", MAX_LINE_BYTES);
            }
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!("Discarding line that is not valid UTF-8");
            }
            other => return other.map_err(map_codec_error),
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            Error::MalformedMessage(format!("line too long: exceeded {} bytes", MAX_LINE_BYTES))
        }
        LinesCodecError::Io(e) => Error::Io(e),
    }
}
