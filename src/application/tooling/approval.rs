use super::error::DispatchError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Previously approved invocations for one session. Tools are allowlisted
/// by name; shell-like tools additionally by their exact command line, so a
/// standing approval for `ls -la` does not cover `rm -rf /`.
#[derive(Debug, Clone, Default)]
pub struct SessionAllowlist {
    tools: HashSet<String>,
    commands: HashSet<String>,
}

impl SessionAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tools<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
            commands: HashSet::new(),
        }
    }

    pub fn allow_tool(&mut self, name: impl Into<String>) {
        self.tools.insert(name.into());
    }

    pub fn allow_command(&mut self, command: impl Into<String>) {
        self.commands.insert(command.into());
    }

    pub fn contains_tool(&self, name: &str) -> bool {
        self.tools.contains(name)
    }

    pub fn contains_command(&self, command: &str) -> bool {
        self.commands.contains(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalRequirement {
    Allowed,
    NeedsConfirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationDecision {
    ProceedOnce,
    ProceedAlways,
    Cancel,
}

fn invocation_of(arguments: &Value) -> Option<&str> {
    arguments.get("command").and_then(Value::as_str)
}

/// Pure approval policy: no I/O, no clock, no state mutation. A tool call
/// is exempt from confirmation when its name is allowlisted or, for calls
/// carrying a `command` argument, when that exact invocation is.
pub fn evaluate(tool: &str, arguments: &Value, allowlist: &SessionAllowlist) -> ApprovalRequirement {
    if allowlist.contains_tool(tool) {
        return ApprovalRequirement::Allowed;
    }
    if let Some(command) = invocation_of(arguments) {
        if allowlist.contains_command(command) {
            return ApprovalRequirement::Allowed;
        }
    }
    ApprovalRequirement::NeedsConfirmation
}

/// Asks for an interactive decision when the policy requires one. The
/// dispatcher owns the I/O; the policy above stays pure.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, tool: &str, arguments: &Value) -> ConfirmationDecision;
}

pub struct AutoApprove;

#[async_trait]
impl Confirmer for AutoApprove {
    async fn confirm(&self, _tool: &str, _arguments: &Value) -> ConfirmationDecision {
        ConfirmationDecision::ProceedOnce
    }
}

pub struct AutoDeny;

#[async_trait]
impl Confirmer for AutoDeny {
    async fn confirm(&self, _tool: &str, _arguments: &Value) -> ConfirmationDecision {
        ConfirmationDecision::Cancel
    }
}

/// Confirmation layer sitting above dispatch.
pub struct ApprovalGate {
    allowlist: Mutex<SessionAllowlist>,
    confirmer: Arc<dyn Confirmer>,
}

impl ApprovalGate {
    pub fn new(allowlist: SessionAllowlist, confirmer: Arc<dyn Confirmer>) -> Self {
        Self {
            allowlist: Mutex::new(allowlist),
            confirmer,
        }
    }

    /// Clears a call for dispatch, asking the confirmer when needed.
    /// `ProceedAlways` widens the session allowlist for future calls.
    pub async fn clear(&self, tool: &str, arguments: &Value) -> Result<(), DispatchError> {
        let requirement = {
            let allowlist = self.allowlist.lock().expect("allowlist lock");
            evaluate(tool, arguments, &allowlist)
        };
        match requirement {
            ApprovalRequirement::Allowed => Ok(()),
            ApprovalRequirement::NeedsConfirmation => {
                match self.confirmer.confirm(tool, arguments).await {
                    ConfirmationDecision::ProceedOnce => Ok(()),
                    ConfirmationDecision::ProceedAlways => {
                        let mut allowlist = self.allowlist.lock().expect("allowlist lock");
                        match invocation_of(arguments) {
                            Some(command) => allowlist.allow_command(command.to_string()),
                            None => allowlist.allow_tool(tool.to_string()),
                        }
                        debug!(tool, "standing approval recorded");
                        Ok(())
                    }
                    ConfirmationDecision::Cancel => Err(DispatchError::Rejected {
                        tool: tool.to_string(),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn allowlisted_name_is_exempt() {
        let allowlist = SessionAllowlist::from_tools(["read_file"]);
        assert_eq!(
            evaluate("read_file", &json!({"path": "/tmp/x"}), &allowlist),
            ApprovalRequirement::Allowed
        );
        assert_eq!(
            evaluate("write_file", &json!({"path": "/tmp/x"}), &allowlist),
            ApprovalRequirement::NeedsConfirmation
        );
    }

    #[test]
    fn shell_invocation_must_match_exactly() {
        let mut allowlist = SessionAllowlist::new();
        allowlist.allow_command("ls -la");
        assert_eq!(
            evaluate("shell", &json!({"command": "ls -la"}), &allowlist),
            ApprovalRequirement::Allowed
        );
        assert_eq!(
            evaluate("shell", &json!({"command": "rm -rf /"}), &allowlist),
            ApprovalRequirement::NeedsConfirmation
        );
    }

    #[tokio::test]
    async fn proceed_always_widens_the_allowlist() {
        struct OnceThenPanic;

        #[async_trait]
        impl Confirmer for OnceThenPanic {
            async fn confirm(&self, _tool: &str, _arguments: &Value) -> ConfirmationDecision {
                ConfirmationDecision::ProceedAlways
            }
        }

        let gate = ApprovalGate::new(SessionAllowlist::new(), Arc::new(OnceThenPanic));
        gate.clear("search", &json!({})).await.expect("first clear");

        // Second call must be exempt without consulting the confirmer; an
        // AutoDeny swap proves the allowlist carried the approval.
        let gate = ApprovalGate {
            allowlist: Mutex::new({
                let mut allowlist = SessionAllowlist::new();
                allowlist.allow_tool("search");
                allowlist
            }),
            confirmer: Arc::new(AutoDeny),
        };
        gate.clear("search", &json!({})).await.expect("allowlisted");
    }

    #[tokio::test]
    async fn cancel_rejects_the_call() {
        let gate = ApprovalGate::new(SessionAllowlist::new(), Arc::new(AutoDeny));
        let result = gate.clear("shell", &json!({"command": "rm -rf /"})).await;
        assert!(matches!(result, Err(DispatchError::Rejected { .. })));
    }
}
