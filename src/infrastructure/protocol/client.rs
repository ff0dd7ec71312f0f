use super::error::{ProtocolError, TransportError};
use super::transport::{Connector, Transport};
use super::types::{
    methods, ErrorCode, InitializeResult, Notification, ProtocolMessage, Request, Response,
    ServerCapabilities, ToolDescriptor, ToolResult, PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RECONNECTS: u32 = 3;
const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_name: String,
    pub request_timeout: Duration,
    pub max_reconnects: u32,
    pub reconnect_backoff: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_name: env!("CARGO_PKG_NAME").to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }
}

/// Connection lifecycle. `Ready` is the only state in which public requests
/// are admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Initializing,
    Connected,
    Ready,
    Error,
}

/// Client half of the tool invocation protocol: correlates requests to
/// responses by id and times out unanswered calls. A lost transport is
/// re-established on the next request, with a bounded number of attempts
/// before the call fails with [`ProtocolError::ReconnectExhausted`].
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    name: String,
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    state: Mutex<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, ProtocolError>>>>,
    next_id: AtomicI64,
    generation: AtomicU64,
    closed: AtomicBool,
    capabilities: Mutex<Option<ServerCapabilities>>,
    instructions: Mutex<Option<String>>,
    tools: Mutex<Vec<ToolDescriptor>>,
    connect_lock: AsyncMutex<()>,
}

impl ProtocolClient {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                name: name.into(),
                connector,
                options,
                state: Mutex::new(ConnectionState::Disconnected),
                transport: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                capabilities: Mutex::new(None),
                instructions: Mutex::new(None),
                tools: Mutex::new(Vec::new()),
                connect_lock: AsyncMutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("state lock")
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        *self.inner.capabilities.lock().expect("capabilities lock")
    }

    pub fn instructions(&self) -> Option<String> {
        self.inner.instructions.lock().expect("instructions lock").clone()
    }

    /// Tool catalog as of the last `tools/list` fetch. Refreshed on connect
    /// and whenever the server notifies `tools/list_changed`.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner.tools.lock().expect("tools lock").clone()
    }

    pub async fn ensure_ready(&self) -> Result<(), ProtocolError> {
        self.inner.ensure_ready().await
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        self.request_with_cancel(method, params, &CancellationToken::new())
            .await
    }

    /// Like [`request`](Self::request) but abandons the call (and removes it
    /// from the pending table) when `cancel` fires first.
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ProtocolError> {
        self.inner.ensure_ready().await?;
        self.inner.check_capability(method)?;
        self.inner
            .send_request(method, params, self.inner.options.request_timeout, cancel)
            .await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), ProtocolError> {
        self.inner.ensure_ready().await?;
        self.inner
            .write(&ProtocolMessage::Notification(Notification::new(method, Some(params))))
            .await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, ProtocolError> {
        self.call_tool_with_cancel(name, arguments, &CancellationToken::new())
            .await
    }

    pub async fn call_tool_with_cancel(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ProtocolError> {
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let result = self
            .request_with_cancel(
                methods::TOOLS_CALL,
                json!({ "name": name, "arguments": arguments }),
                cancel,
            )
            .await?;
        serde_json::from_value(result).map_err(ProtocolError::Encode)
    }

    /// Forces the connection down. Cancels every pending call with a
    /// "connection closed" rejection and disables reconnection.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Disconnected);
        let transport = self.inner.transport.lock().expect("transport lock").take();
        if let Some(transport) = transport {
            transport.shutdown().await;
        }
        self.inner.fail_all_pending();
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.inner.pending.lock().expect("pending lock").len()
    }
}

impl ClientInner {
    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().expect("state lock") = next;
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock")
    }

    /// Connects if the client is not `Ready`. A failed attempt, whether the
    /// transport or the `initialize` handshake, is retried up to
    /// `max_reconnects` times with a fixed backoff; after that the call
    /// fails with `ReconnectExhausted`.
    async fn ensure_ready(self: &Arc<Self>) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        if self.current_state() == ConnectionState::Ready {
            return Ok(());
        }
        let _guard = self.connect_lock.lock().await;
        if self.current_state() == ConnectionState::Ready {
            return Ok(());
        }

        match self.establish().await {
            Ok(()) => return Ok(()),
            Err(err) if self.options.max_reconnects == 0 => return Err(err),
            Err(err) => warn!(server = %self.name, %err, "connection attempt failed"),
        }
        for attempt in 1..=self.options.max_reconnects {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ProtocolError::ConnectionClosed);
            }
            tokio::time::sleep(self.options.reconnect_backoff).await;
            info!(server = %self.name, attempt, "reconnect attempt");
            match self.establish().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(server = %self.name, attempt, %err, "reconnect attempt failed");
                }
            }
        }
        self.set_state(ConnectionState::Error);
        Err(ProtocolError::ReconnectExhausted {
            attempts: self.options.max_reconnects,
        })
    }

    /// One full connection attempt: transport, reader task, handshake,
    /// catalog fetch. Leaves the state at `Ready` on success.
    async fn establish(self: &Arc<Self>) -> Result<(), ProtocolError> {
        self.set_state(ConnectionState::Connecting);
        let transport = match self.connector.connect().await {
            Ok(transport) => transport,
            Err(err) => {
                self.set_state(ConnectionState::Error);
                return Err(err.into());
            }
        };
        {
            let mut slot = self.transport.lock().expect("transport lock");
            *slot = Some(transport.clone());
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let reader_self = Arc::clone(self);
        let reader_transport = transport.clone();
        tokio::spawn(async move {
            reader_self.reader_loop(reader_transport, generation).await;
        });

        self.set_state(ConnectionState::Initializing);
        match self.handshake().await {
            Ok(()) => {
                self.set_state(ConnectionState::Ready);
                info!(server = %self.name, "protocol connection ready");
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Error);
                transport.shutdown().await;
                Err(err)
            }
        }
    }

    async fn handshake(self: &Arc<Self>) -> Result<(), ProtocolError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": self.options.client_name,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });
        let raw = self
            .send_request(
                methods::INITIALIZE,
                params,
                self.options.request_timeout,
                &CancellationToken::new(),
            )
            .await?;
        let result: InitializeResult =
            serde_json::from_value(raw).map_err(|err| ProtocolError::Handshake(err.to_string()))?;

        {
            let mut capabilities = self.capabilities.lock().expect("capabilities lock");
            *capabilities = Some(result.capabilities);
        }
        {
            let mut instructions = self.instructions.lock().expect("instructions lock");
            *instructions = result.instructions;
        }
        self.set_state(ConnectionState::Connected);

        self.write(&ProtocolMessage::Notification(Notification::new(
            methods::NOTIF_INITIALIZED,
            Some(json!({})),
        )))
        .await?;

        if result.capabilities.tools {
            self.refresh_tools().await?;
        }
        Ok(())
    }

    fn check_capability(&self, method: &str) -> Result<(), ProtocolError> {
        let capabilities = self
            .capabilities
            .lock()
            .expect("capabilities lock")
            .unwrap_or_default();
        let supported = if method.starts_with("tools/") {
            capabilities.tools
        } else if method.starts_with("resources/") {
            capabilities.resources
        } else if method.starts_with("prompts/") {
            capabilities.prompts
        } else {
            true
        };
        if supported {
            Ok(())
        } else {
            Err(ProtocolError::Unsupported {
                method: method.to_string(),
            })
        }
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.insert(id, tx);
        }

        let message = ProtocolMessage::Request(Request::new(id, method, Some(params)));
        if let Err(err) = self.write(&message).await {
            self.take_pending(id);
            return Err(err);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.take_pending(id);
                Err(ProtocolError::Cancelled { method: method.to_string() })
            }
            outcome = tokio::time::timeout(timeout, &mut rx) => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
                Err(_elapsed) => {
                    // The response may have won the race between the timer
                    // firing and us reclaiming the pending slot.
                    if self.take_pending(id).is_some() {
                        warn!(server = %self.name, method, id, "request timed out");
                        Err(ProtocolError::Timeout { method: method.to_string() })
                    } else {
                        match rx.try_recv() {
                            Ok(result) => result,
                            Err(_) => Err(ProtocolError::Timeout { method: method.to_string() }),
                        }
                    }
                }
            }
        }
    }

    fn take_pending(&self, id: i64) -> Option<oneshot::Sender<Result<Value, ProtocolError>>> {
        self.pending.lock().expect("pending lock").remove(&id)
    }

    fn fail_all_pending(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().collect()
        };
        for (_, sender) in drained {
            let _ = sender.send(Err(ProtocolError::ConnectionClosed));
        }
    }

    async fn write(&self, message: &ProtocolMessage) -> Result<(), ProtocolError> {
        let encoded = message.encode().map_err(ProtocolError::Encode)?;
        let transport = {
            let slot = self.transport.lock().expect("transport lock");
            slot.clone()
        };
        match transport {
            Some(transport) => Ok(transport.send(&encoded).await?),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn refresh_tools(&self) -> Result<(), ProtocolError> {
        let result = self
            .send_request(
                methods::TOOLS_LIST,
                json!({}),
                self.options.request_timeout,
                &CancellationToken::new(),
            )
            .await?;
        let tools: Vec<ToolDescriptor> = result
            .get("tools")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(ProtocolError::Encode)?
            .unwrap_or_default();
        debug!(server = %self.name, count = tools.len(), "tool catalog refreshed");
        let mut slot = self.tools.lock().expect("tools lock");
        *slot = tools;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, transport: Arc<dyn Transport>, generation: u64) {
        while let Some(line) = transport.recv().await {
            match ProtocolMessage::decode(&line) {
                Ok(ProtocolMessage::Response(response)) => self.resolve(response),
                Ok(ProtocolMessage::Request(request)) => {
                    self.answer_server_request(&transport, request).await;
                }
                Ok(ProtocolMessage::Notification(notification)) => {
                    self.handle_notification(notification);
                }
                Err(err) => {
                    warn!(server = %self.name, %err, line, "received invalid protocol message");
                }
            }
        }

        // A newer connection may already own the pending table.
        if generation != self.generation.load(Ordering::SeqCst) {
            return;
        }
        self.fail_all_pending();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        warn!(server = %self.name, "transport lost; will reconnect on the next request");
    }

    fn resolve(&self, response: Response) {
        let Some(id) = response.id else {
            debug!(server = %self.name, "response without id dropped");
            return;
        };
        let Some(sender) = self.take_pending(id) else {
            debug!(server = %self.name, id, "response for unknown request dropped");
            return;
        };
        let outcome = match response.error {
            Some(error) => Err(ProtocolError::Rpc {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = sender.send(outcome);
    }

    async fn answer_server_request(&self, transport: &Arc<dyn Transport>, request: Request) {
        let response = match request.method.as_str() {
            "ping" => Response::success(request.id, json!({})),
            other => Response::failure(
                request.id,
                ErrorCode::MethodNotFound,
                format!("client does not implement method '{other}'"),
            ),
        };
        if let Ok(encoded) = ProtocolMessage::Response(response).encode() {
            if let Err(err) = transport.send(&encoded).await {
                match err {
                    TransportError::Closed => {}
                    other => warn!(server = %self.name, %other, "failed to answer server request"),
                }
            }
        }
    }

    fn handle_notification(self: &Arc<Self>, notification: Notification) {
        debug!(server = %self.name, method = %notification.method, "notification received");
        if notification.method == methods::NOTIF_TOOLS_CHANGED {
            let refresh_self = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = refresh_self.refresh_tools().await {
                    warn!(server = %refresh_self.name, %err, "failed to refresh tool catalog");
                }
            });
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &crate::config::ProtocolConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            max_reconnects: config.max_reconnects,
            reconnect_backoff: config.reconnect_backoff,
            ..Self::default()
        }
    }
}

#[cfg(test)]
impl ProtocolClient {
    /// Request with an explicit timeout, bypassing the readiness check.
    /// Test hook for exercising the pending-call table directly.
    pub(crate) async fn raw_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        self.inner
            .send_request(method, params, timeout, &CancellationToken::new())
            .await
    }

    pub(crate) async fn attach_transport_for_tests(&self, transport: Arc<dyn Transport>) {
        let mut slot = self.inner.transport.lock().expect("transport lock");
        *slot = Some(transport.clone());
        drop(slot);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let reader_self = Arc::clone(&self.inner);
        tokio::spawn(async move {
            reader_self.reader_loop(transport, generation).await;
        });
    }
}
