use super::*;
use crate::application::tooling::{tool_fn, DispatcherOptions, ToolRegistry};
use crate::domain::ChatMessage;
use crate::infrastructure::model::{CompletionError, CompletionOptions, CompletionProvider};
use crate::infrastructure::protocol::{ToolDescriptor, ToolResult};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone)]
struct ScriptedProvider {
    responses: Arc<Mutex<Vec<String>>>,
    recordings: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(
                responses.into_iter().map(String::from).collect(),
            )),
            recordings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.recordings.lock().await.clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _options: &CompletionOptions,
    ) -> Result<String, CompletionError> {
        self.recordings.lock().await.push(messages);
        let mut responses = self.responses.lock().await;
        if responses.is_empty() {
            return Err(CompletionError::Unavailable("script exhausted".into()));
        }
        Ok(responses.remove(0))
    }
}

fn empty_registry() -> Arc<ToolRegistry> {
    Arc::new(ToolRegistry::new(DispatcherOptions::default()))
}

fn descriptor(name: &str) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: None,
        input_schema: None,
    }
}

#[tokio::test]
async fn run_completes_with_final_answer() {
    let provider = ScriptedProvider::new(vec![
        "The goal is a greeting.",
        r#"{"subtasks":[{"id":"greet","title":"Greet the user"}]}"#,
        r#"{"action":"final","response":"hello there"}"#,
        "Straightforward run, nothing to improve.",
    ]);
    let runner = AgentRunner::new(Arc::new(provider.clone()), empty_registry());
    let (handle, _events) = AgentHandle::new();

    let outcome = runner.run(AgentContext::new("say hello"), handle).await;

    assert_eq!(outcome.state, AgentState::Completed);
    assert_eq!(outcome.final_answer.as_deref(), Some("hello there"));
    assert!(outcome.failure.is_none());
    let kinds: Vec<StepKind> = outcome.steps.iter().map(|step| step.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StepKind::Thought,
            StepKind::Plan,
            StepKind::Action,
            StepKind::Reflection,
        ]
    );

    let requests = provider.requests().await;
    assert!(requests[0]
        .iter()
        .any(|message| message.content.contains("say hello")));
}

#[tokio::test]
async fn step_budget_ends_run_after_exactly_that_many_steps() {
    let provider = ScriptedProvider::new(vec![
        "Working on it.",
        "no structured plan here",
        r#"{"action":"call_tool","tool":"echo","input":{"text":"hi"}}"#,
    ]);
    let registry = empty_registry();
    registry
        .register(
            descriptor("echo"),
            tool_fn(|arguments| async move {
                let text = arguments
                    .get("text")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(ToolResult::text(text))
            }),
        )
        .expect("register echo");
    let runner = AgentRunner::new(Arc::new(provider), registry);
    let (handle, _events) = AgentHandle::new();

    let context = AgentContext::new("never finishes").with_max_steps(3);
    let outcome = runner.run(context, handle).await;

    assert_eq!(outcome.state, AgentState::Error);
    assert_eq!(outcome.failure, Some(RunFailure::StepBudgetExhausted));
    assert_eq!(outcome.steps.len(), 3);
}

#[tokio::test]
async fn abort_mid_tool_call_ends_run_as_aborted() {
    let provider = ScriptedProvider::new(vec![
        "Working on it.",
        r#"{"subtasks":[{"id":"wait","title":"Wait forever"}]}"#,
        r#"{"action":"call_tool","tool":"slow","input":{}}"#,
    ]);
    let registry = empty_registry();
    registry
        .register(
            descriptor("slow"),
            tool_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ToolResult::text("too late"))
            }),
        )
        .expect("register slow");
    let runner = Arc::new(AgentRunner::new(Arc::new(provider), registry));
    let (handle, _events) = AgentHandle::new();

    let task = tokio::spawn({
        let runner = Arc::clone(&runner);
        let handle = handle.clone();
        async move { runner.run(AgentContext::new("wait"), handle).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    let outcome = task.await.expect("run task");
    assert_eq!(outcome.state, AgentState::Error);
    assert_eq!(outcome.failure, Some(RunFailure::Aborted));
    // The action step was logged before the call; no observation followed.
    assert!(outcome
        .steps
        .iter()
        .all(|step| step.kind != StepKind::Observation));
}

#[tokio::test]
async fn pause_suspends_execution_until_resume() {
    let provider = ScriptedProvider::new(vec![
        "Working on it.",
        "free-form plan",
        r#"{"action":"final","response":"done after pause"}"#,
        "Short run.",
    ]);
    let runner = Arc::new(AgentRunner::new(Arc::new(provider), empty_registry()));
    let (handle, mut events) = AgentHandle::new();
    handle.pause();

    let task = tokio::spawn({
        let runner = Arc::clone(&runner);
        let handle = handle.clone();
        async move { runner.run(AgentContext::new("pausable"), handle).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.resume();

    let outcome = task.await.expect("run task");
    assert_eq!(outcome.state, AgentState::Completed);
    assert_eq!(outcome.final_answer.as_deref(), Some("done after pause"));

    let mut saw_pause = false;
    let mut saw_resume = false;
    while let Ok(event) = events.try_recv() {
        match event {
            AgentEvent::StateChanged {
                to: AgentState::Paused,
                ..
            } => saw_pause = true,
            AgentEvent::StateChanged {
                from: AgentState::Paused,
                ..
            } => saw_resume = true,
            _ => {}
        }
    }
    assert!(saw_pause);
    assert!(saw_resume);
}

#[tokio::test]
async fn provider_failure_ends_run_in_error() {
    let provider = ScriptedProvider::new(vec![]);
    let runner = AgentRunner::new(Arc::new(provider), empty_registry());
    let (handle, _events) = AgentHandle::new();

    let outcome = runner.run(AgentContext::new("doomed"), handle).await;

    assert_eq!(outcome.state, AgentState::Error);
    assert!(matches!(outcome.failure, Some(RunFailure::Provider(_))));
    assert!(outcome.steps.is_empty());
}

#[tokio::test]
async fn tool_failure_becomes_an_observation_not_a_crash() {
    let provider = ScriptedProvider::new(vec![
        "Working on it.",
        r#"{"subtasks":[{"id":"probe","title":"Probe"}]}"#,
        r#"{"action":"call_tool","tool":"missing","input":{}}"#,
        r#"{"action":"final","response":"recovered"}"#,
        "Recovered from a missing tool.",
    ]);
    let runner = AgentRunner::new(Arc::new(provider), empty_registry());
    let (handle, _events) = AgentHandle::new();

    let context = AgentContext::new("resilient").with_max_steps(10);
    let outcome = runner.run(context, handle).await;

    // The failed task drops plan progress below the threshold, so the run
    // continues with a free-form step and still reaches a final answer.
    assert_eq!(outcome.state, AgentState::Completed);
    assert_eq!(outcome.final_answer.as_deref(), Some("recovered"));
    let observation = outcome
        .steps
        .iter()
        .find(|step| step.kind == StepKind::Observation)
        .expect("observation step");
    assert_eq!(observation.metadata["success"], json!(false));
}

#[tokio::test]
async fn blocked_tools_are_rejected_before_dispatch() {
    let provider = ScriptedProvider::new(vec![
        "Working on it.",
        r#"{"subtasks":[{"id":"t","title":"Try the blocked tool"}]}"#,
        r#"{"action":"call_tool","tool":"danger","input":{}}"#,
        r#"{"action":"final","response":"gave up"}"#,
        "Tool was blocked.",
    ]);
    let registry = empty_registry();
    registry
        .register(
            descriptor("danger"),
            tool_fn(|_| async { Ok(ToolResult::text("should never run")) }),
        )
        .expect("register danger");
    let runner = AgentRunner::new(Arc::new(provider), registry);
    let (handle, _events) = AgentHandle::new();

    let context = AgentContext::new("careful").with_blocked_tools(["danger"]);
    let outcome = runner.run(context, handle).await;

    let observation = outcome
        .steps
        .iter()
        .find(|step| step.kind == StepKind::Observation)
        .expect("observation step");
    assert!(observation.content.contains("not permitted"));
    assert_eq!(observation.metadata["success"], json!(false));
}
