mod approval;
mod error;
mod interface;
mod registry;
mod remote;

pub use approval::{
    evaluate, ApprovalGate, ApprovalRequirement, AutoApprove, AutoDeny, ConfirmationDecision,
    Confirmer, SessionAllowlist,
};
pub use error::{DispatchError, HandlerError, RegistryError};
pub use interface::{tool_fn, ToolHandler, ToolProvider};
pub use registry::{DispatcherOptions, ToolRegistry};
