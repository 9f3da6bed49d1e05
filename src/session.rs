//! Session controller
//!
//! A [`Session`] owns one worker process, the pending-request table, and the
//! event subscriber slot. It moves through
//! `Uninitialized -> Initializing -> Ready -> Disposed`; `dispose` is allowed
//! from any state and a disposed session can be initialized again.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio::sync::oneshot::error::TryRecvError;
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::worker::{
    decode_envelope, encode_request, EventBroadcaster, EventSubscription, MessageKind,
    RequestRouter, ResponseReceiver, WorkerListener, WorkerProcess,
};
use crate::{Error, Result};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Disposed,
}

/// State touched by the worker's stdout reader
struct SessionShared {
    router: RequestRouter,
    events: EventBroadcaster,
}

impl WorkerListener for SessionShared {
    fn on_line(&self, line: &str) {
        let message = decode_envelope(line);

        match message.kind {
            MessageKind::Response => match message.request_id {
                Some(request_id) => {
                    self.router
                        .complete(&request_id, message.is_error, message.payload);
                }
                None => tracing::warn!("Dropping response without requestId: {}", line),
            },
            MessageKind::Event => {
                if !self.events.publish(message.payload) {
                    tracing::trace!("No event subscriber, dropping event");
                }
            }
            MessageKind::Unknown => {
                tracing::warn!("Ignoring unrecognized worker message: {}", line);
            }
        }
    }

    fn on_exit(&self, reason: &str) {
        let failed = self
            .router
            .fail_all(|| Error::ProcessDied(reason.to_string()));
        tracing::warn!(
            "Worker exited ({}), failed {} pending request(s)",
            reason,
            failed
        );

        self.events.publish(json!({
            "type": "event",
            "event": "disconnected",
            "reason": reason,
        }));
    }
}

/// A sent request whose response has not been read yet
pub struct PendingResponse {
    request_id: String,
    receiver: ResponseReceiver,
    shared: Arc<SessionShared>,
    timeout: Option<Duration>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the worker's response, bounded by the session's request
    /// timeout. A timed-out request is removed from the pending table.
    pub async fn wait(mut self) -> Result<JsonValue> {
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.shared.router.discard(&self.request_id);
                    tracing::warn!("Request {} timed out after {:?}", self.request_id, limit);
                    return Err(Error::Timeout(limit));
                }
            },
            None => (&mut self.receiver).await,
        };

        outcome.map_err(|_| Error::ProcessDied("response channel closed".to_string()))?
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // Nothing arrived yet, so the entry is still in the table with nobody
        // left to read it
        if let Err(TryRecvError::Empty) = self.receiver.try_recv() {
            tracing::debug!("Abandoning pending request {}", self.request_id);
            self.shared.router.discard(&self.request_id);
        }
    }
}

/// One logical connection to the worker process
pub struct Session {
    config: ChannelConfig,
    worker: WorkerProcess,
    shared: Arc<SessionShared>,
    state: Mutex<SessionState>,

    /// Serializes initialize and dispose
    lifecycle: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            worker: WorkerProcess::new(),
            shared: Arc::new(SessionShared {
                router: RequestRouter::new(),
                events: EventBroadcaster::new(),
            }),
            state: Mutex::new(SessionState::Uninitialized),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.shared.router.len()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        tracing::debug!("Session state {:?} -> {:?}", *current, state);
        *current = state;
    }

    fn require_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            _ => Err(Error::NotInitialized),
        }
    }

    /// Start the worker and send it `initialize` with `params`.
    ///
    /// Succeeds without doing anything if the session is ready and the worker
    /// is alive.
    pub async fn initialize(&self, params: JsonValue) -> Result<JsonValue> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() == SessionState::Ready && self.worker.is_running() {
            return Ok(json!({
                "success": true,
                "message": "Already initialized",
            }));
        }

        self.set_state(SessionState::Initializing);

        if let Err(e) = self.start_worker(&params).await {
            tracing::error!("Failed to initialize MCP worker: {}", e);
            self.worker.stop().await;
            self.set_state(SessionState::Uninitialized);
            return Err(Error::InitializationFailed(e.to_string()));
        }

        self.set_state(SessionState::Ready);
        tracing::info!("MCP session initialized");

        Ok(json!({
            "success": true,
            "message": "MCP initialized successfully",
        }))
    }

    async fn start_worker(&self, params: &JsonValue) -> Result<()> {
        let spec = self.config.worker.launch_spec()?;
        let listener: Arc<dyn WorkerListener> = self.shared.clone();
        self.worker.start(&spec, listener).await?;

        let request_id = format!("init_{}", Uuid::new_v4());
        let line = encode_request("initialize", params, &request_id)?;

        if !self.config.await_initialize_ack {
            // Spawn plus a successful write counts as ready
            self.worker.send(&line).await?;
            return Ok(());
        }

        let pending = self.send_tracked(request_id, &line).await?;
        let reply = pending.wait().await?;
        tracing::debug!("Worker acknowledged initialize: {}", reply);
        Ok(())
    }

    /// Register `request_id`, then send `line`; the entry is removed again if
    /// the write fails.
    async fn send_tracked(&self, request_id: String, line: &str) -> Result<PendingResponse> {
        let receiver = self.shared.router.register(&request_id)?;

        if let Err(e) = self.worker.send(line).await {
            self.shared.router.discard(&request_id);
            tracing::warn!("Failed to send request {}: {}", request_id, e);
            return Err(Error::SendFailed(e));
        }

        Ok(PendingResponse {
            request_id,
            receiver,
            shared: self.shared.clone(),
            timeout: self.config.request_timeout(),
        })
    }

    /// Forward a request to the worker and return a handle to its response.
    ///
    /// `request` must be an object carrying a `requestId`; it is sent as the
    /// envelope's params unchanged.
    pub async fn process_message(&self, request: JsonValue) -> Result<PendingResponse> {
        self.require_ready()?;

        let request_id = request_id_of(&request)?.ok_or(Error::MissingRequestId)?;
        let line = encode_request("processMessage", &request, &request_id)?;

        self.send_tracked(request_id, &line).await
    }

    /// Forward a streaming request. Returns as soon as it is written; output
    /// arrives later as events.
    pub async fn stream_message(&self, request: JsonValue) -> Result<JsonValue> {
        self.require_ready()?;

        let request_id = request_id_of(&request)?
            .unwrap_or_else(|| format!("stream_{}", Uuid::new_v4()));
        let line = encode_request("streamMessage", &request, &request_id)?;
        self.worker.send(&line).await?;

        Ok(json!({
            "success": true,
            "message": "Stream started",
            "requestId": request_id,
        }))
    }

    /// Report whether the worker is alive
    pub async fn test_connection(&self) -> Result<JsonValue> {
        self.require_ready()?;

        let status = self.worker.status().await;
        Ok(json!({
            "connected": status.running,
            "metadata": {
                "pid": status.pid,
                "uptimeMs": status.uptime.map(|d| d.as_millis() as u64),
                "pendingRequests": self.shared.router.len(),
            },
        }))
    }

    pub fn get_capabilities(&self) -> Result<JsonValue> {
        self.require_ready()?;
        Ok(self.config.capabilities())
    }

    /// Forward extra context to the worker without waiting for a reply
    pub async fn inject_context(&self, context: JsonValue) -> Result<JsonValue> {
        self.require_ready()?;

        let request_id = format!("context_{}", Uuid::new_v4());
        let line = encode_request("injectContext", &context, &request_id)?;
        self.worker.send(&line).await?;

        Ok(json!({
            "success": true,
            "message": "Context injected",
        }))
    }

    /// Attach the event listener, replacing any previous one
    pub fn subscribe(&self) -> EventSubscription {
        self.shared.events.attach()
    }

    /// Detach `subscription` if it is still the current listener
    pub fn unsubscribe(&self, subscription: &EventSubscription) -> bool {
        self.shared.events.detach_if(subscription.id())
    }

    /// Stop the worker, fail everything still pending, and drop the listener.
    pub async fn dispose(&self) -> Result<JsonValue> {
        let _lifecycle = self.lifecycle.lock().await;

        self.worker.stop().await;
        let failed = self.shared.router.fail_all(|| Error::SessionDisposed);
        self.shared.events.detach();
        self.set_state(SessionState::Disposed);

        tracing::info!("MCP session disposed ({} pending request(s) failed)", failed);

        Ok(json!({
            "success": true,
            "message": "MCP disposed",
        }))
    }

    /// Route one line of worker output as if the worker had written it.
    pub fn handle_worker_line(&self, line: &str) {
        self.shared.on_line(line);
    }
}

/// Extract `requestId` from a request object (numbers are accepted).
fn request_id_of(request: &JsonValue) -> Result<Option<String>> {
    let object = request
        .as_object()
        .ok_or_else(|| Error::InvalidArguments("Request must be a map".to_string()))?;

    Ok(match object.get("requestId") {
        Some(JsonValue::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;

    /// Worker that answers every request with `result: 42`
    const ECHO_WORKER: &str = r#"while IFS= read -r line; do id=$(printf "%s" "$line" | sed -n "s/.*\"requestId\":\"\([^\"]*\)\".*/\1/p"); printf "{\"type\":\"response\",\"requestId\":\"%s\",\"error\":null,\"result\":42}\n" "$id"; done"#;

    fn shell_config(script: &str, extra: &[&str]) -> ChannelConfig {
        let mut args = vec!["-c".to_string(), script.to_string()];
        args.extend(extra.iter().map(|a| a.to_string()));
        ChannelConfig {
            worker: WorkerConfig::command("sh", args),
            ..ChannelConfig::default()
        }
    }

    fn shell_session(script: &str, extra: &[&str]) -> Session {
        Session::new(shell_config(script, extra))
    }

    async fn wait_for_file_containing(path: &std::path::Path, needle: &str) -> String {
        for _ in 0..100 {
            let content = std::fs::read_to_string(path).unwrap_or_default();
            if content.contains(needle) {
                return content;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{:?} never contained {}", path, needle);
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let session = shell_session("cat > /dev/null", &[]);

        assert!(matches!(
            session.process_message(json!({"requestId": "1"})).await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            session.stream_message(json!({})).await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            session.test_connection().await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            session.get_capabilities(),
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            session.inject_context(json!({})).await,
            Err(Error::NotInitialized)
        ));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_initialize_twice_is_noop() {
        let session = shell_session("cat > /dev/null", &[]);

        let first = session.initialize(json!({})).await.unwrap();
        assert_eq!(first["message"], "MCP initialized successfully");
        assert_eq!(session.state(), SessionState::Ready);

        let second = session.initialize(json!({})).await.unwrap();
        assert_eq!(second["message"], "Already initialized");

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_fails_when_worker_cannot_start() {
        let config = ChannelConfig {
            worker: WorkerConfig::command("/nonexistent/worker-binary", Vec::new()),
            ..ChannelConfig::default()
        };
        let session = Session::new(config);

        let err = session.initialize(json!({})).await.unwrap_err();
        assert!(matches!(err, Error::InitializationFailed(_)));
        assert_eq!(err.code(), "INITIALIZATION_FAILED");
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_normal_call() {
        let dir = tempfile::tempdir().unwrap();
        let sent = dir.path().join("sent.jsonl");
        let session = shell_session(r#"cat > "$0""#, &[sent.to_str().unwrap()]);
        session.initialize(json!({"name": "test"})).await.unwrap();

        let pending = session
            .process_message(json!({"requestId": "1", "foo": "bar"}))
            .await
            .unwrap();
        assert_eq!(pending.request_id(), "1");

        let content = wait_for_file_containing(&sent, r#""requestId":"1""#).await;
        let lines: Vec<JsonValue> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["method"], "initialize");
        assert_eq!(lines[0]["params"]["name"], "test");
        assert_eq!(lines[1]["method"], "processMessage");
        assert_eq!(lines[1]["params"]["foo"], "bar");

        session.handle_worker_line(r#"{"type":"response","requestId":"1","error":null,"result":42}"#);
        let response = pending.wait().await.unwrap();
        assert_eq!(response["result"], 42);
        assert_eq!(session.pending_requests(), 0);

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_call() {
        let session = shell_session("cat > /dev/null", &[]);
        session.initialize(json!({})).await.unwrap();

        let pending = session
            .process_message(json!({"requestId": "1"}))
            .await
            .unwrap();
        session.handle_worker_line(r#"{"type":"response","requestId":"1","error":{"msg":"bad"}}"#);

        match pending.wait().await {
            Err(Error::Remote(payload)) => assert_eq!(payload["error"]["msg"], "bad"),
            other => panic!("expected remote error, got {:?}", other),
        }

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_late_response_is_ignored() {
        let session = shell_session("cat > /dev/null", &[]);
        session.initialize(json!({})).await.unwrap();

        session.handle_worker_line(r#"{"type":"response","requestId":"ghost","error":null}"#);
        session.handle_worker_line(r#"{"type":"response","error":null}"#);
        session.handle_worker_line("garbage");
        assert_eq!(session.state(), SessionState::Ready);

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_through_worker() {
        let session = shell_session(ECHO_WORKER, &[]);
        session.initialize(json!({})).await.unwrap();

        let pending = session
            .process_message(json!({"requestId": "abc", "text": "hi"}))
            .await
            .unwrap();
        let response = pending.wait().await.unwrap();
        assert_eq!(response["requestId"], "abc");
        assert_eq!(response["result"], 42);

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_await_initialize_ack() {
        let config = ChannelConfig {
            await_initialize_ack: true,
            ..shell_config(ECHO_WORKER, &[])
        };
        let session = Session::new(config);

        session.initialize(json!({})).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.pending_requests(), 0);

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_await_initialize_ack_times_out() {
        let config = ChannelConfig {
            await_initialize_ack: true,
            request_timeout_ms: 100,
            ..shell_config("cat > /dev/null", &[])
        };
        let session = Session::new(config);

        let err = session.initialize(json!({})).await.unwrap_err();
        assert!(matches!(err, Error::InitializationFailed(_)));
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_missing_request_id() {
        let session = shell_session("cat > /dev/null", &[]);
        session.initialize(json!({})).await.unwrap();

        assert!(matches!(
            session.process_message(json!({"foo": "bar"})).await,
            Err(Error::MissingRequestId)
        ));
        assert!(matches!(
            session.process_message(json!("not a map")).await,
            Err(Error::InvalidArguments(_))
        ));
        assert_eq!(session.pending_requests(), 0);

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_rejected() {
        let session = shell_session("cat > /dev/null", &[]);
        session.initialize(json!({})).await.unwrap();

        let _first = session
            .process_message(json!({"requestId": "same"}))
            .await
            .unwrap();
        assert!(matches!(
            session.process_message(json!({"requestId": "same"})).await,
            Err(Error::DuplicateRequestId(_))
        ));
        assert_eq!(session.pending_requests(), 1);

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let config = ChannelConfig {
            request_timeout_ms: 100,
            ..shell_config("cat > /dev/null", &[])
        };
        let session = Session::new(config);
        session.initialize(json!({})).await.unwrap();

        let pending = session
            .process_message(json!({"requestId": "slow"}))
            .await
            .unwrap();
        assert!(matches!(pending.wait().await, Err(Error::Timeout(_))));
        assert_eq!(session.pending_requests(), 0);

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_response_leaves_no_entry() {
        let session = shell_session("cat > /dev/null", &[]);
        session.initialize(json!({})).await.unwrap();

        let pending = session
            .process_message(json!({"requestId": "gone"}))
            .await
            .unwrap();
        assert_eq!(session.pending_requests(), 1);

        drop(pending);
        assert_eq!(session.pending_requests(), 0);

        // The id is free again and a late reply is ignored
        session.handle_worker_line(r#"{"type":"response","requestId":"gone","error":null}"#);
        let again = session
            .process_message(json!({"requestId": "gone"}))
            .await
            .unwrap();
        session.handle_worker_line(r#"{"type":"response","requestId":"gone","error":null,"result":1}"#);
        assert_eq!(again.wait().await.unwrap()["result"], 1);
        assert_eq!(session.pending_requests(), 0);

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_fails_pending_requests() {
        let session = shell_session("cat > /dev/null", &[]);
        session.initialize(json!({})).await.unwrap();

        let a = session.process_message(json!({"requestId": "a"})).await.unwrap();
        let b = session.process_message(json!({"requestId": "b"})).await.unwrap();
        let mut events = session.subscribe();

        session.dispose().await.unwrap();
        assert_eq!(session.state(), SessionState::Disposed);
        assert_eq!(session.pending_requests(), 0);
        assert!(matches!(a.wait().await, Err(Error::SessionDisposed)));
        assert!(matches!(b.wait().await, Err(Error::SessionDisposed)));

        // Subscriber does not outlive the session
        session.handle_worker_line(r#"{"type":"event","name":"late"}"#);
        assert!(events.try_recv().is_none());

        assert!(matches!(
            session.process_message(json!({"requestId": "c"})).await,
            Err(Error::NotInitialized)
        ));

        // Disposed is resettable
        session.initialize(json!({})).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_fan_out() {
        let session = shell_session("cat > /dev/null", &[]);
        session.initialize(json!({})).await.unwrap();

        // No subscriber: dropped silently
        session.handle_worker_line(r#"{"type":"event","name":"progress"}"#);

        let mut events = session.subscribe();
        session.handle_worker_line(r#"{"type":"event","name":"progress"}"#);
        assert_eq!(events.try_recv().unwrap()["name"], "progress");
        assert!(events.try_recv().is_none());

        assert!(session.unsubscribe(&events));
        session.handle_worker_line(r#"{"type":"event","name":"progress"}"#);
        assert!(events.try_recv().is_none());

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_crash_fails_pending_requests() {
        // Exits after reading the initialize and processMessage lines
        let session = shell_session("head -n 2 > /dev/null", &[]);
        session.initialize(json!({})).await.unwrap();
        let mut events = session.subscribe();

        let pending = session
            .process_message(json!({"requestId": "1"}))
            .await
            .unwrap();
        assert!(matches!(pending.wait().await, Err(Error::ProcessDied(_))));
        assert_eq!(session.pending_requests(), 0);

        let disconnected = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(disconnected["event"], "disconnected");

        assert!(matches!(
            session.stream_message(json!({})).await,
            Err(Error::SendFailed(_))
        ));

        // Initialize starts a fresh worker
        let reply = session.initialize(json!({})).await.unwrap();
        assert_eq!(reply["message"], "MCP initialized successfully");
        session.stream_message(json!({})).await.unwrap();

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_message_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let sent = dir.path().join("sent.jsonl");
        let session = shell_session(r#"cat > "$0""#, &[sent.to_str().unwrap()]);
        session.initialize(json!({})).await.unwrap();

        let ack = session
            .stream_message(json!({"text": "hello"}))
            .await
            .unwrap();
        assert_eq!(ack["success"], true);
        let generated = ack["requestId"].as_str().unwrap().to_string();
        assert!(generated.starts_with("stream_"));

        let ack = session
            .stream_message(json!({"requestId": "s1"}))
            .await
            .unwrap();
        assert_eq!(ack["requestId"], "s1");

        session.inject_context(json!({"file": "a.rs"})).await.unwrap();

        let content = wait_for_file_containing(&sent, "injectContext").await;
        assert!(content.contains(&generated));
        assert!(content.contains(r#""requestId":"s1""#));
        assert!(content.contains(r#""file":"a.rs""#));
        // Streaming requests are not tracked
        assert_eq!(session.pending_requests(), 0);

        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_and_capabilities() {
        let session = shell_session("cat > /dev/null", &[]);
        session.initialize(json!({})).await.unwrap();

        let status = session.test_connection().await.unwrap();
        assert_eq!(status["connected"], true);
        assert!(status["metadata"]["pid"].is_number());

        let capabilities = session.get_capabilities().unwrap();
        assert_eq!(capabilities["filesystem"]["supportsCancel"], false);

        session.dispose().await.unwrap();
    }
}
