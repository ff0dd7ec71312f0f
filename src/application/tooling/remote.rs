use super::error::DispatchError;
use super::interface::ToolProvider;
use crate::infrastructure::protocol::{
    ErrorCode, ProtocolClient, ProtocolError, ToolDescriptor, ToolResult,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A connected protocol client doubles as a remote tool provider: its
/// cached `tools/list` catalog answers lookups and `tools/call` services
/// dispatch.
#[async_trait]
impl ToolProvider for ProtocolClient {
    fn name(&self) -> &str {
        ProtocolClient::name(self)
    }

    async fn catalog(&self) -> Vec<ToolDescriptor> {
        if let Err(err) = self.ensure_ready().await {
            warn!(server = %ProtocolClient::name(self), %err, "provider unavailable for catalog");
            return Vec::new();
        }
        self.tools()
    }

    async fn call(
        &self,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, DispatchError> {
        self.call_tool_with_cancel(tool, arguments, cancel)
            .await
            .map_err(|source| match source {
                ProtocolError::Timeout { .. } => DispatchError::Timeout {
                    tool: tool.to_string(),
                },
                ProtocolError::Cancelled { .. } => DispatchError::Cancelled {
                    tool: tool.to_string(),
                },
                ProtocolError::Rpc { code, .. }
                    if ErrorCode::from_code(code) == Some(ErrorCode::ToolNotFound) =>
                {
                    DispatchError::NotFound(tool.to_string())
                }
                other => DispatchError::Protocol {
                    tool: tool.to_string(),
                    source: other,
                },
            })
    }
}
