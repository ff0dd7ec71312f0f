use crate::infrastructure::protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Failure reported by a local tool handler. Converted into an erroneous
/// tool result at the dispatch boundary, never propagated as a panic.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a tool named '{0}' is already registered")]
    DuplicateName(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no tool named '{0}' is registered")]
    NotFound(String),
    #[error("tool '{tool}' timed out")]
    Timeout { tool: String },
    #[error("tool '{tool}' failed: {message}")]
    Execution { tool: String, message: String },
    #[error("tool '{tool}' was not approved for execution")]
    Rejected { tool: String },
    #[error("tool '{tool}' call cancelled")]
    Cancelled { tool: String },
    #[error("tool '{tool}' failed at the protocol layer: {source}")]
    Protocol {
        tool: String,
        #[source]
        source: ProtocolError,
    },
}

impl DispatchError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DispatchError::NotFound(_) => ErrorCode::ToolNotFound,
            DispatchError::Timeout { .. } => ErrorCode::TimeoutError,
            DispatchError::Protocol { source, .. } => source.error_code(),
            DispatchError::Execution { .. }
            | DispatchError::Rejected { .. }
            | DispatchError::Cancelled { .. } => ErrorCode::ToolExecutionError,
        }
    }
}
