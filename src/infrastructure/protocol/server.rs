use super::error::ProtocolError;
use super::transport::Transport;
use super::types::{
    methods, ErrorCode, InitializeResult, PeerInfo, ProtocolMessage, PromptDescriptor, Request,
    ResourceDescriptor, Response, ServerCapabilities, JSONRPC_VERSION, PROTOCOL_VERSION,
};
use crate::application::tooling::{RegistryError, ToolRegistry};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

const DEFAULT_MAX_IN_FLIGHT: usize = 8;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource '{0}' not found")]
    NotFound(String),
    #[error("access to resource '{0}' denied")]
    AccessDenied(String),
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(&self, uri: &str) -> Result<Value, ResourceError>;
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub name: String,
    pub instructions: Option<String>,
    pub max_in_flight: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            instructions: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// Server half of the tool invocation protocol. Routes requests to the tool
/// registry and the resource/prompt tables, keeps at most `max_in_flight`
/// requests executing (the rest queue FIFO), and drains cleanly on
/// shutdown.
pub struct ProtocolServer {
    options: ServerOptions,
    tools: Arc<ToolRegistry>,
    resources: Mutex<HashMap<String, (ResourceDescriptor, Arc<dyn ResourceHandler>)>>,
    resource_order: Mutex<Vec<String>>,
    prompts: Mutex<HashMap<String, (PromptDescriptor, Value)>>,
    prompt_order: Mutex<Vec<String>>,
    permits: Arc<Semaphore>,
    shutting_down: AtomicBool,
    in_flight: watch::Sender<usize>,
}

impl ProtocolServer {
    pub fn new(options: ServerOptions, tools: Arc<ToolRegistry>) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
        Self {
            options,
            tools,
            resources: Mutex::new(HashMap::new()),
            resource_order: Mutex::new(Vec::new()),
            prompts: Mutex::new(HashMap::new()),
            prompt_order: Mutex::new(Vec::new()),
            permits,
            shutting_down: AtomicBool::new(false),
            in_flight: watch::channel(0).0,
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn register_resource(
        &self,
        descriptor: ResourceDescriptor,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<(), RegistryError> {
        let mut resources = self.resources.lock().expect("resources lock");
        if resources.contains_key(&descriptor.uri) {
            return Err(RegistryError::DuplicateName(descriptor.uri.clone()));
        }
        let uri = descriptor.uri.clone();
        resources.insert(uri.clone(), (descriptor, handler));
        self.resource_order.lock().expect("order lock").push(uri);
        Ok(())
    }

    pub fn register_prompt(
        &self,
        descriptor: PromptDescriptor,
        content: Value,
    ) -> Result<(), RegistryError> {
        let mut prompts = self.prompts.lock().expect("prompts lock");
        if prompts.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name.clone()));
        }
        let name = descriptor.name.clone();
        prompts.insert(name.clone(), (descriptor, content));
        self.prompt_order.lock().expect("order lock").push(name);
        Ok(())
    }

    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: true,
            resources: !self.resources.lock().expect("resources lock").is_empty(),
            prompts: !self.prompts.lock().expect("prompts lock").is_empty(),
        }
    }

    /// Routes one request. Admission control happens in [`serve`]; calling
    /// this directly bypasses the in-flight cap.
    pub async fn handle(&self, request: Request) -> Response {
        if request.jsonrpc != JSONRPC_VERSION {
            return Response::failure(
                request.id,
                ErrorCode::InvalidRequest,
                "unsupported jsonrpc version (expected 2.0)",
            );
        }
        debug!(method = %request.method, id = request.id, "handling request");
        let params = request.params.unwrap_or(Value::Null);
        match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(request.id),
            methods::TOOLS_LIST => {
                let tools = self.tools.local_catalog();
                Response::success(request.id, json!({ "tools": tools }))
            }
            methods::TOOLS_CALL => self.handle_tool_call(request.id, params).await,
            methods::RESOURCES_LIST => {
                let order = self.resource_order.lock().expect("order lock").clone();
                let resources = self.resources.lock().expect("resources lock");
                let listed: Vec<_> = order
                    .iter()
                    .filter_map(|uri| resources.get(uri).map(|(descriptor, _)| descriptor.clone()))
                    .collect();
                Response::success(request.id, json!({ "resources": listed }))
            }
            methods::RESOURCES_READ => self.handle_resource_read(request.id, params).await,
            methods::PROMPTS_LIST => {
                let order = self.prompt_order.lock().expect("order lock").clone();
                let prompts = self.prompts.lock().expect("prompts lock");
                let listed: Vec<_> = order
                    .iter()
                    .filter_map(|name| prompts.get(name).map(|(descriptor, _)| descriptor.clone()))
                    .collect();
                Response::success(request.id, json!({ "prompts": listed }))
            }
            methods::PROMPTS_GET => self.handle_prompt_get(request.id, params),
            other => Response::failure(
                request.id,
                ErrorCode::MethodNotFound,
                format!("method '{other}' is not supported"),
            ),
        }
    }

    fn handle_initialize(&self, id: i64) -> Response {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: self.capabilities(),
            server_info: PeerInfo {
                name: self.options.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: self.options.instructions.clone(),
        };
        match serde_json::to_value(result) {
            Ok(value) => Response::success(id, value),
            Err(err) => Response::failure(id, ErrorCode::InternalError, err.to_string()),
        }
    }

    async fn handle_tool_call(&self, id: i64, params: Value) -> Response {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Response::failure(
                id,
                ErrorCode::InvalidParams,
                "params.name must be a string",
            );
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        match self.tools.dispatch(name, arguments).await {
            Ok(result) => match serde_json::to_value(result) {
                Ok(value) => Response::success(id, value),
                Err(err) => Response::failure(id, ErrorCode::InternalError, err.to_string()),
            },
            Err(err) => {
                let code = err.error_code();
                // Execution failures already arrive as erroneous results;
                // reaching here means dispatch itself failed.
                Response::failure(id, code, err.to_string())
            }
        }
    }

    async fn handle_resource_read(&self, id: i64, params: Value) -> Response {
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return Response::failure(id, ErrorCode::InvalidParams, "params.uri must be a string");
        };
        let handler = {
            let resources = self.resources.lock().expect("resources lock");
            resources.get(uri).map(|(_, handler)| handler.clone())
        };
        let Some(handler) = handler else {
            return Response::failure(
                id,
                ErrorCode::ResourceNotFound,
                format!("resource '{uri}' not found"),
            );
        };
        match handler.read(uri).await {
            Ok(contents) => Response::success(id, json!({ "contents": contents })),
            Err(ResourceError::NotFound(uri)) => Response::failure(
                id,
                ErrorCode::ResourceNotFound,
                format!("resource '{uri}' not found"),
            ),
            Err(ResourceError::AccessDenied(uri)) => Response::failure(
                id,
                ErrorCode::ResourceAccessDenied,
                format!("access to resource '{uri}' denied"),
            ),
        }
    }

    fn handle_prompt_get(&self, id: i64, params: Value) -> Response {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Response::failure(id, ErrorCode::InvalidParams, "params.name must be a string");
        };
        let prompts = self.prompts.lock().expect("prompts lock");
        match prompts.get(name) {
            Some((_, content)) => Response::success(id, json!({ "prompt": content })),
            None => Response::failure(
                id,
                ErrorCode::MethodNotFound,
                format!("prompt '{name}' is not defined"),
            ),
        }
    }

    /// Serves one connection until the transport closes or [`shutdown`]
    /// fires. Requests beyond the in-flight cap queue in arrival order.
    pub async fn serve(self: Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), ProtocolError> {
        info!(server = %self.options.name, "serving protocol connection");
        while let Some(line) = transport.recv().await {
            match ProtocolMessage::decode(&line) {
                Ok(ProtocolMessage::Request(request)) => {
                    let id = request.id;
                    if self.shutting_down.load(Ordering::SeqCst) {
                        self.reply(&transport, shutting_down_response(id)).await;
                        continue;
                    }
                    // FIFO admission: the serve loop itself waits for a
                    // permit, so queued requests keep their arrival order.
                    let permit = match self.permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.reply(&transport, shutting_down_response(id)).await;
                            continue;
                        }
                    };
                    self.in_flight.send_modify(|count| *count += 1);
                    let server = Arc::clone(&self);
                    let task_transport = transport.clone();
                    tokio::spawn(async move {
                        let response = server.handle(request).await;
                        server.reply(&task_transport, response).await;
                        drop(permit);
                        server.in_flight.send_modify(|count| *count -= 1);
                    });
                }
                Ok(ProtocolMessage::Notification(notification)) => {
                    if notification.method == methods::NOTIF_INITIALIZED {
                        debug!(server = %self.options.name, "client completed initialization");
                    } else {
                        debug!(
                            server = %self.options.name,
                            method = %notification.method,
                            "notification ignored"
                        );
                    }
                }
                Ok(ProtocolMessage::Response(_)) => {
                    debug!(server = %self.options.name, "unexpected response dropped");
                }
                Err(err) => {
                    warn!(server = %self.options.name, %err, "malformed message");
                    self.reply(&transport, Response::parse_error(err.to_string()))
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn reply(&self, transport: &Arc<dyn Transport>, response: Response) {
        match ProtocolMessage::Response(response).encode() {
            Ok(encoded) => {
                if let Err(err) = transport.send(&encoded).await {
                    debug!(server = %self.options.name, %err, "failed to send response");
                }
            }
            Err(err) => warn!(server = %self.options.name, %err, "failed to encode response"),
        }
    }

    /// Stops admitting requests, fails anything still queued, and waits for
    /// in-flight work to finish before returning.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.permits.close();
        let mut in_flight = self.in_flight.subscribe();
        let _ = in_flight.wait_for(|count| *count == 0).await;
        info!(server = %self.options.name, "server drained and stopped");
    }
}

fn shutting_down_response(id: i64) -> Response {
    Response::failure(id, ErrorCode::InternalError, "server is shutting down")
}
