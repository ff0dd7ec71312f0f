use super::error::{DispatchError, RegistryError};
use super::interface::{ToolHandler, ToolProvider};
use crate::config::DispatchConfig;
use crate::infrastructure::protocol::{ToolDescriptor, ToolResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_MAX_CONCURRENT: usize = 3;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub max_concurrent: usize,
    pub call_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl DispatcherOptions {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_tools,
            call_timeout: config.tool_timeout,
        }
    }
}

struct LocalTool {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
}

/// Named tool definitions plus dispatch. Local registrations are looked up
/// first; remote providers are consulted in registration order, first
/// catalog match wins. Every dispatched call runs under a per-call timeout
/// and a fair concurrency cap: waiters are admitted first-in-first-out as
/// slots free up.
pub struct ToolRegistry {
    local: Mutex<HashMap<String, LocalTool>>,
    local_order: Mutex<Vec<String>>,
    providers: Mutex<Vec<Arc<dyn ToolProvider>>>,
    permits: Arc<Semaphore>,
    options: DispatcherOptions,
}

impl ToolRegistry {
    pub fn new(options: DispatcherOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        Self {
            local: Mutex::new(HashMap::new()),
            local_order: Mutex::new(Vec::new()),
            providers: Mutex::new(Vec::new()),
            permits,
            options,
        }
    }

    pub fn register(
        &self,
        descriptor: ToolDescriptor,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        let mut local = self.local.lock().expect("local tools lock");
        if local.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name.clone()));
        }
        let name = descriptor.name.clone();
        local.insert(name.clone(), LocalTool { descriptor, handler });
        self.local_order.lock().expect("order lock").push(name.clone());
        info!(tool = %name, "local tool registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.local.lock().expect("local tools lock").remove(name).is_some();
        if removed {
            self.local_order
                .lock()
                .expect("order lock")
                .retain(|entry| entry != name);
            info!(tool = name, "local tool unregistered");
        }
        removed
    }

    pub fn add_provider(&self, provider: Arc<dyn ToolProvider>) {
        info!(provider = provider.name(), "remote tool provider added");
        self.providers.lock().expect("providers lock").push(provider);
    }

    pub fn local_catalog(&self) -> Vec<ToolDescriptor> {
        let local = self.local.lock().expect("local tools lock");
        let order = self.local_order.lock().expect("order lock");
        order
            .iter()
            .filter_map(|name| local.get(name).map(|tool| tool.descriptor.clone()))
            .collect()
    }

    /// Full catalog: local tools first, then each provider's tools in
    /// registration order.
    pub async fn catalog(&self) -> Vec<ToolDescriptor> {
        let mut all = self.local_catalog();
        let providers: Vec<_> = self.providers.lock().expect("providers lock").clone();
        for provider in providers {
            all.extend(provider.catalog().await);
        }
        all
    }

    /// Stops admitting dispatches. Calls already holding a permit run to
    /// completion; everything after fails with a cancellation error.
    pub fn close(&self) {
        info!("tool registry closed");
        self.permits.close();
    }

    pub async fn dispatch(&self, name: &str, arguments: Value) -> Result<ToolResult, DispatchError> {
        self.dispatch_with_cancel(name, arguments, &CancellationToken::new())
            .await
    }

    pub async fn dispatch_with_cancel(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, DispatchError> {
        // Fair semaphore: excess calls queue FIFO until a slot frees. A
        // closed semaphore means the registry was shut down.
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Err(DispatchError::Cancelled {
                    tool: name.to_string(),
                })
            }
        };

        let local_handler = {
            let local = self.local.lock().expect("local tools lock");
            local.get(name).map(|tool| tool.handler.clone())
        };

        if let Some(handler) = local_handler {
            debug!(tool = name, "dispatching local tool");
            return self.run_local(name, handler, arguments, cancel).await;
        }

        let providers: Vec<_> = self.providers.lock().expect("providers lock").clone();
        for provider in providers {
            let catalog = provider.catalog().await;
            if catalog.iter().any(|tool| tool.name == name) {
                debug!(tool = name, provider = provider.name(), "dispatching remote tool");
                return self.run_remote(name, provider, arguments, cancel).await;
            }
        }

        warn!(tool = name, "dispatch requested for unknown tool");
        Err(DispatchError::NotFound(name.to_string()))
    }

    async fn run_local(
        &self,
        name: &str,
        handler: Arc<dyn ToolHandler>,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, DispatchError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(DispatchError::Cancelled { tool: name.to_string() }),
            outcome = tokio::time::timeout(self.options.call_timeout, handler.invoke(arguments)) => {
                match outcome {
                    Ok(Ok(result)) => Ok(result),
                    // Handler failures become erroneous results, never
                    // dispatcher crashes.
                    Ok(Err(failure)) => Ok(ToolResult::error_text(failure.to_string())),
                    Err(_) => Err(DispatchError::Timeout { tool: name.to_string() }),
                }
            }
        }
    }

    async fn run_remote(
        &self,
        name: &str,
        provider: Arc<dyn ToolProvider>,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, DispatchError> {
        match tokio::time::timeout(
            self.options.call_timeout,
            provider.call(name, arguments, cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout { tool: name.to_string() }),
        }
    }
}
