//! Worker process management
//!
//! This module handles spawning, monitoring, and communicating with the
//! MCP worker subprocess via newline-delimited JSON over stdio.

pub mod codec;
pub mod events;
mod process;
pub mod router;

pub use codec::{decode_envelope, encode_request, InboundMessage, MessageKind};
pub use events::{EventBroadcaster, EventSubscription};
pub use process::{LaunchSpec, WorkerListener, WorkerProcess, WorkerStatus};
pub use router::{RequestRouter, ResponseReceiver};
