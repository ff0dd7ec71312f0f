//! Agent orchestration engine: a goal-driven agent state machine, an
//! execution plan tracker, and a JSON-RPC-style tool invocation protocol
//! spanning in-process tools and out-of-process tool servers.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::agent::{
    AgentContext, AgentHandle, AgentOptions, AgentOutcome, AgentRunner, AgentState, RunFailure,
};
pub use application::plan::{ExecutionPlan, PlanProgress, SubTask, TaskStatus};
pub use application::tooling::{
    ApprovalGate, DispatchError, DispatcherOptions, RegistryError, ToolHandler, ToolProvider,
    ToolRegistry,
};
pub use config::AppConfig;
pub use domain::{ChatMessage, MessageRole};
pub use infrastructure::model::{CompletionError, CompletionOptions, CompletionProvider};
pub use infrastructure::protocol::{
    ProtocolClient, ProtocolError, ProtocolServer, ToolDescriptor, ToolResult,
};
