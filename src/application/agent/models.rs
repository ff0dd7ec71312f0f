use super::state::AgentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Thought,
    Plan,
    Action,
    Observation,
    Reflection,
}

/// One entry in the run's audit trail. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub id: u64,
    pub kind: StepKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub duration: Duration,
    #[serde(default)]
    pub metadata: Value,
}

/// Append-only step log. Ids are monotonic and timestamps never decrease,
/// even if the wall clock steps backwards mid-run.
#[derive(Debug, Default)]
pub(super) struct StepLog {
    steps: Vec<AgentStep>,
    next_id: u64,
    last_at: Option<DateTime<Utc>>,
}

impl StepLog {
    pub fn append(
        &mut self,
        kind: StepKind,
        content: impl Into<String>,
        duration: Duration,
        metadata: Value,
    ) -> u64 {
        let now = Utc::now();
        let created_at = match self.last_at {
            Some(last) if now < last => last,
            _ => now,
        };
        self.last_at = Some(created_at);
        let id = self.next_id;
        self.next_id += 1;
        self.steps.push(AgentStep {
            id,
            kind,
            content: content.into(),
            created_at,
            duration,
            metadata,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn steps(&self) -> &[AgentStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<AgentStep> {
        self.steps
    }
}

/// Everything fixed for the lifetime of one run.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub goal: String,
    pub session_id: String,
    pub constraints: Vec<String>,
    pub max_steps: usize,
    pub max_duration: Duration,
    pub allowed_tools: Vec<String>,
    pub blocked_tools: Vec<String>,
}

impl AgentContext {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            session_id: Uuid::new_v4().to_string(),
            constraints: Vec::new(),
            max_steps: 16,
            max_duration: Duration::from_secs(300),
            allowed_tools: Vec::new(),
            blocked_tools: Vec::new(),
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_constraints<I, S>(mut self, constraints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constraints = constraints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blocked_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// An empty allow-list permits every tool; the block-list always wins.
    pub fn tool_permitted(&self, name: &str) -> bool {
        if self.blocked_tools.iter().any(|blocked| blocked == name) {
            return false;
        }
        self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|allowed| allowed == name)
    }
}

/// Why a run ended in [`AgentState::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RunFailure {
    #[error("step budget exhausted")]
    StepBudgetExhausted,
    #[error("time budget exhausted")]
    TimeBudgetExhausted,
    #[error("run aborted")]
    Aborted,
    #[error("completion provider failed: {0}")]
    Provider(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

/// Final report of one run: terminal state, partial or full answer, and the
/// complete step log for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub run_id: String,
    pub state: AgentState,
    pub final_answer: Option<String>,
    pub steps: Vec<AgentStep>,
    pub failure: Option<RunFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_ids_are_unique_and_timestamps_non_decreasing() {
        let mut log = StepLog::default();
        for _ in 0..50 {
            log.append(StepKind::Thought, "t", Duration::ZERO, Value::Null);
        }
        let steps = log.steps();
        for pair in steps.windows(2) {
            assert!(pair[1].id > pair[0].id);
            assert!(pair[1].created_at >= pair[0].created_at);
        }
    }

    #[test]
    fn block_list_wins_over_allow_list() {
        let context = AgentContext::new("goal").with_blocked_tools(["rm"]);
        assert!(context.tool_permitted("echo"));
        assert!(!context.tool_permitted("rm"));

        let mut restricted = AgentContext::new("goal");
        restricted.allowed_tools = vec!["echo".into()];
        restricted.blocked_tools = vec!["echo".into()];
        assert!(!restricted.tool_permitted("echo"));
        assert!(!restricted.tool_permitted("other"));
    }

    #[test]
    fn steps_serialize_with_metadata() {
        let mut log = StepLog::default();
        log.append(
            StepKind::Action,
            "call",
            Duration::from_millis(5),
            json!({"tool": "echo"}),
        );
        let encoded = serde_json::to_string(log.steps()).expect("serialize");
        assert!(encoded.contains("\"action\""));
        assert!(encoded.contains("\"echo\""));
    }
}
