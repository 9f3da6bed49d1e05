//! Pending request table
//!
//! Maps request ids to the caller waiting on the reply. Entries are completed
//! from the stdout reader task and registered from the caller's task, so every
//! operation takes the table lock; the lock is never held across an await.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::{Error, Result};

/// Receiving half of a pending request's completion slot
pub type ResponseReceiver = oneshot::Receiver<Result<JsonValue>>;

/// A request waiting for its response
#[derive(Debug)]
struct PendingRequest {
    sender: oneshot::Sender<Result<JsonValue>>,
    created_at: DateTime<Utc>,
}

impl PendingRequest {
    fn resolve(self, result: Result<JsonValue>) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.sender.send(result);
    }
}

/// Correlates outbound requests with inbound responses
#[derive(Debug, Default)]
pub struct RequestRouter {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl RequestRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request id and return the slot its response will land in.
    ///
    /// An id that is already pending is rejected; the existing entry is left
    /// untouched.
    pub fn register(&self, request_id: &str) -> Result<ResponseReceiver> {
        let mut pending = self.pending.lock();
        if pending.contains_key(request_id) {
            return Err(Error::DuplicateRequestId(request_id.to_string()));
        }

        let (sender, receiver) = oneshot::channel();
        pending.insert(
            request_id.to_string(),
            PendingRequest {
                sender,
                created_at: Utc::now(),
            },
        );
        Ok(receiver)
    }

    /// Resolve a pending request from a worker response.
    ///
    /// Returns `false` when the id is not pending (late or duplicate reply).
    pub fn complete(&self, request_id: &str, is_error: bool, payload: JsonValue) -> bool {
        let Some(entry) = self.pending.lock().remove(request_id) else {
            tracing::debug!("Dropping response for unknown request {}", request_id);
            return false;
        };

        let age = Utc::now() - entry.created_at;
        tracing::debug!(
            "Request {} completed after {}ms (error: {})",
            request_id,
            age.num_milliseconds(),
            is_error
        );

        entry.resolve(if is_error {
            Err(Error::Remote(payload))
        } else {
            Ok(payload)
        });
        true
    }

    /// Resolve one pending request with a failure.
    pub fn fail(&self, request_id: &str, error: Error) -> bool {
        match self.pending.lock().remove(request_id) {
            Some(entry) => {
                entry.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Remove a pending request without resolving it.
    pub fn discard(&self, request_id: &str) -> bool {
        self.pending.lock().remove(request_id).is_some()
    }

    /// Fail every pending request and clear the table.
    ///
    /// Returns the number of requests that were failed.
    pub fn fail_all<F>(&self, reason: F) -> usize
    where
        F: Fn() -> Error,
    {
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (request_id, entry) in drained {
            tracing::debug!("Failing pending request {}", request_id);
            entry.resolve(Err(reason()));
        }
        count
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
