use super::error::{DispatchError, HandlerError};
use crate::infrastructure::protocol::{ToolDescriptor, ToolResult};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A locally registered tool capability.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, arguments: Value) -> Result<ToolResult, HandlerError>;
}

/// A remote source of tools, consulted after local registrations in
/// registration order. The first provider whose catalog contains the
/// requested name services the call.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn catalog(&self) -> Vec<ToolDescriptor>;

    async fn call(
        &self,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, DispatchError>;
}

struct FnTool<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResult, HandlerError>> + Send,
{
    async fn invoke(&self, arguments: Value) -> Result<ToolResult, HandlerError> {
        (self.f)(arguments).await
    }
}

/// Wraps an async closure as a [`ToolHandler`].
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResult, HandlerError>> + Send + 'static,
{
    Arc::new(FnTool { f })
}
