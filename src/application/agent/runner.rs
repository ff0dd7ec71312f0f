use super::decompose::{self, Directive};
use super::models::{AgentContext, AgentOutcome, RunFailure, StepKind, StepLog};
use super::state::{transition, AgentEvent, AgentState, Signal};
use crate::application::memory::{ContextProvider, NoopContext};
use crate::application::plan::{ExecutionPlan, SubTask, TaskStatus};
use crate::application::session::{MemorySessionStore, SessionStore};
use crate::application::tooling::{
    ApprovalGate, AutoApprove, DispatchError, SessionAllowlist, ToolRegistry,
};
use crate::config::AgentConfig;
use crate::domain::ChatMessage;
use crate::infrastructure::model::{CompletionOptions, CompletionProvider};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub completion: CompletionOptions,
    /// Plan progress at which the agent synthesizes a final answer instead
    /// of taking further free-form steps.
    pub completion_threshold: f64,
    pub consolidate_every: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            completion: CompletionOptions::default(),
            completion_threshold: 0.8,
            consolidate_every: 5,
        }
    }
}

impl AgentOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            completion: CompletionOptions::default(),
            completion_threshold: config.completion_threshold,
            consolidate_every: config.consolidate_every,
        }
    }
}

/// External control surface of a run: abort, pause/resume, and the event
/// feed. Cheap to clone; all clones steer the same run.
#[derive(Clone)]
pub struct AgentHandle {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (pause, _) = watch::channel(false);
        (
            Self {
                cancel: CancellationToken::new(),
                pause,
                events,
            },
            receiver,
        )
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

/// Drives one goal through think → plan → execute → reflect. The run is a
/// single logical control flow; concurrency enters only through the tool
/// dispatcher and the fire-and-forget consolidation requests.
pub struct AgentRunner {
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
    memory: Arc<dyn ContextProvider>,
    sessions: Arc<dyn SessionStore>,
    options: AgentOptions,
}

impl AgentRunner {
    pub fn new(provider: Arc<dyn CompletionProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            tools,
            gate: Arc::new(ApprovalGate::new(
                SessionAllowlist::new(),
                Arc::new(AutoApprove),
            )),
            memory: Arc::new(NoopContext),
            sessions: Arc::new(MemorySessionStore::new()),
            options: AgentOptions::default(),
        }
    }

    pub fn with_gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn ContextProvider>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs the goal to a terminal state. Failures end the run in
    /// [`AgentState::Error`] with a [`RunFailure`] reason; the partial step
    /// log is always preserved.
    pub async fn run(&self, context: AgentContext, handle: AgentHandle) -> AgentOutcome {
        let run_id = Uuid::new_v4().to_string();
        info!(run = %run_id, goal = %context.goal, "agent run started");
        let started = Instant::now();
        let mut log = StepLog::default();
        let mut state = AgentState::Idle;
        let mut final_answer = None;

        let failure = match self
            .drive(&context, &handle, &mut state, &mut log, started, &mut final_answer)
            .await
        {
            Ok(()) => None,
            Err(reason) => {
                warn!(run = %run_id, %reason, "agent run failed");
                state = if state.is_active() {
                    match self.apply(&handle, state, Signal::Fail) {
                        Ok(next) => next,
                        Err(_) => AgentState::Error,
                    }
                } else {
                    AgentState::Error
                };
                Some(reason)
            }
        };

        info!(run = %run_id, ?state, steps = log.len(), "agent run finished");
        let outcome = AgentOutcome {
            run_id: run_id.clone(),
            state,
            final_answer,
            steps: log.into_steps(),
            failure,
        };
        if let Err(err) = self.sessions.save(outcome.clone()).await {
            warn!(run = %run_id, %err, "failed to persist run outcome");
        }
        outcome
    }

    async fn drive(
        &self,
        context: &AgentContext,
        handle: &AgentHandle,
        state: &mut AgentState,
        log: &mut StepLog,
        started: Instant,
        final_answer: &mut Option<String>,
    ) -> Result<(), RunFailure> {
        let catalog = self.tools.catalog().await;
        let mut transcript = vec![ChatMessage::system(decompose::system_prompt(
            context, &catalog,
        ))];
        for item in self.memory.relevant_context(&context.goal, 4096).await {
            transcript.push(ChatMessage::system(item.content));
        }

        *state = self.apply(handle, *state, Signal::Start)?;
        self.check_budgets(context, log, started)?;
        let (thought, took) = self
            .complete(handle, &mut transcript, decompose::think_prompt(&context.goal))
            .await?;
        self.record(handle, log, StepKind::Thought, &thought, took, Value::Null);

        *state = self.apply(handle, *state, Signal::PlanRequested)?;
        self.check_budgets(context, log, started)?;
        let (raw_plan, took) = self
            .complete(
                handle,
                &mut transcript,
                decompose::decompose_prompt(&context.goal),
            )
            .await?;
        let subtasks = decompose::parse_subtasks(&raw_plan, &context.goal);
        let titles: Vec<&str> = subtasks.iter().map(|task| task.title.as_str()).collect();
        self.record(
            handle,
            log,
            StepKind::Plan,
            titles.join("; "),
            took,
            json!({ "tasks": subtasks.len() }),
        );
        let mut plan = ExecutionPlan::new(subtasks);

        *state = self.apply(handle, *state, Signal::PlanReady)?;

        loop {
            if handle.is_aborted() {
                return Err(RunFailure::Aborted);
            }
            self.check_budgets(context, log, started)?;
            self.wait_if_paused(handle, state).await?;

            match plan.next_task() {
                Some(task) => {
                    plan.update_status(&task.id, TaskStatus::Executing, None, None)
                        .map_err(internal)?;
                    if self
                        .execute_task(
                            context,
                            handle,
                            log,
                            started,
                            &mut transcript,
                            &mut plan,
                            &task,
                            final_answer,
                        )
                        .await?
                    {
                        break;
                    }
                }
                None => {
                    let progress = plan.progress();
                    if progress.overall >= self.options.completion_threshold {
                        let (answer, took) = self
                            .complete(
                                handle,
                                &mut transcript,
                                decompose::synthesis_prompt(&context.goal),
                            )
                            .await?;
                        self.record(
                            handle,
                            log,
                            StepKind::Action,
                            &answer,
                            took,
                            json!({ "synthesized": true }),
                        );
                        *final_answer = Some(answer);
                        break;
                    }
                    debug!(
                        progress = progress.overall,
                        "no runnable task, taking a free-form step"
                    );
                    if self
                        .free_form_step(context, handle, log, started, &mut transcript, final_answer)
                        .await?
                    {
                        break;
                    }
                }
            }
        }

        *state = self.apply(handle, *state, Signal::GoalSatisfied)?;
        match self
            .complete(
                handle,
                &mut transcript,
                decompose::reflection_prompt(&context.goal),
            )
            .await
        {
            Ok((reflection, took)) => {
                if log.len() < context.max_steps {
                    self.record(handle, log, StepKind::Reflection, &reflection, took, Value::Null);
                }
            }
            Err(RunFailure::Aborted) => return Err(RunFailure::Aborted),
            // Reflection is advisory; its failures never fail the run.
            Err(reason) => warn!(%reason, "reflection failed, continuing"),
        }
        *state = self.apply(handle, *state, Signal::ReflectionDone)?;
        Ok(())
    }

    /// Executes one planned task. Returns `true` when the directive ended
    /// the run with a final answer.
    #[allow(clippy::too_many_arguments)]
    async fn execute_task(
        &self,
        context: &AgentContext,
        handle: &AgentHandle,
        log: &mut StepLog,
        started: Instant,
        transcript: &mut Vec<ChatMessage>,
        plan: &mut ExecutionPlan,
        task: &SubTask,
        final_answer: &mut Option<String>,
    ) -> Result<bool, RunFailure> {
        let (raw, took) = self
            .complete(handle, transcript, decompose::action_prompt(task))
            .await?;
        match decompose::parse_directive(&raw) {
            Directive::Final { response } => {
                self.record(
                    handle,
                    log,
                    StepKind::Action,
                    &response,
                    took,
                    json!({ "task": task.id, "final": true }),
                );
                plan.update_status(&task.id, TaskStatus::Completed, None, None)
                    .map_err(internal)?;
                *final_answer = Some(response);
                Ok(true)
            }
            Directive::CallTool { tool, input } => {
                self.record(
                    handle,
                    log,
                    StepKind::Action,
                    format!("call tool '{tool}'"),
                    took,
                    json!({ "task": task.id, "tool": tool, "input": input }),
                );
                let (content, success, took) =
                    self.invoke_tool(context, handle, &tool, input.clone()).await?;
                self.check_budgets(context, log, started)?;
                self.record(
                    handle,
                    log,
                    StepKind::Observation,
                    &content,
                    took,
                    json!({ "task": task.id, "tool": tool, "success": success }),
                );
                transcript.push(ChatMessage::user(format!("tool result ({tool}): {content}")));
                let status = if success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                let error = (!success).then(|| content.clone());
                plan.update_status(&task.id, status, Some(Value::String(content)), error)
                    .map_err(internal)?;
                Ok(false)
            }
            Directive::Note { content } => {
                // The model decided no tool was needed; the note itself
                // settles the task.
                self.record(
                    handle,
                    log,
                    StepKind::Action,
                    &content,
                    took,
                    json!({ "task": task.id }),
                );
                plan.update_status(
                    &task.id,
                    TaskStatus::Completed,
                    Some(Value::String(content)),
                    None,
                )
                .map_err(internal)?;
                Ok(false)
            }
        }
    }

    /// One unplanned reasoning step to keep making progress when the plan
    /// has nothing runnable but the goal is not yet satisfied.
    async fn free_form_step(
        &self,
        context: &AgentContext,
        handle: &AgentHandle,
        log: &mut StepLog,
        started: Instant,
        transcript: &mut Vec<ChatMessage>,
        final_answer: &mut Option<String>,
    ) -> Result<bool, RunFailure> {
        let (raw, took) = self
            .complete(handle, transcript, decompose::free_form_prompt(&context.goal))
            .await?;
        match decompose::parse_directive(&raw) {
            Directive::Final { response } => {
                self.record(
                    handle,
                    log,
                    StepKind::Action,
                    &response,
                    took,
                    json!({ "final": true }),
                );
                *final_answer = Some(response);
                Ok(true)
            }
            Directive::CallTool { tool, input } => {
                self.record(
                    handle,
                    log,
                    StepKind::Action,
                    format!("call tool '{tool}'"),
                    took,
                    json!({ "tool": tool, "input": input }),
                );
                let (content, success, took) =
                    self.invoke_tool(context, handle, &tool, input).await?;
                self.check_budgets(context, log, started)?;
                self.record(
                    handle,
                    log,
                    StepKind::Observation,
                    &content,
                    took,
                    json!({ "tool": tool, "success": success }),
                );
                transcript.push(ChatMessage::user(format!("tool result ({tool}): {content}")));
                Ok(false)
            }
            Directive::Note { content } => {
                self.record(handle, log, StepKind::Thought, &content, took, Value::Null);
                Ok(false)
            }
        }
    }

    /// Tool failures come back as erroneous observations; only an abort is
    /// fatal here.
    async fn invoke_tool(
        &self,
        context: &AgentContext,
        handle: &AgentHandle,
        tool: &str,
        input: Value,
    ) -> Result<(String, bool, Duration), RunFailure> {
        if !context.tool_permitted(tool) {
            return Ok((
                format!("tool '{tool}' is not permitted for this run"),
                false,
                Duration::ZERO,
            ));
        }
        if let Err(err) = self.gate.clear(tool, &input).await {
            return Ok((err.to_string(), false, Duration::ZERO));
        }
        let begun = Instant::now();
        match self
            .tools
            .dispatch_with_cancel(tool, input, handle.cancellation())
            .await
        {
            Ok(result) => {
                let text = result
                    .first_text()
                    .unwrap_or("(no textual content)")
                    .to_string();
                Ok((text, !result.is_error, begun.elapsed()))
            }
            Err(DispatchError::Cancelled { .. }) => Err(RunFailure::Aborted),
            Err(err) => Ok((err.to_string(), false, begun.elapsed())),
        }
    }

    async fn complete(
        &self,
        handle: &AgentHandle,
        transcript: &mut Vec<ChatMessage>,
        prompt: String,
    ) -> Result<(String, Duration), RunFailure> {
        if handle.is_aborted() {
            return Err(RunFailure::Aborted);
        }
        transcript.push(ChatMessage::user(prompt));
        let begun = Instant::now();
        let result = tokio::select! {
            _ = handle.cancel.cancelled() => return Err(RunFailure::Aborted),
            result = self
                .provider
                .complete(transcript.clone(), &self.options.completion) => result,
        };
        let text = result.map_err(|err| RunFailure::Provider(err.to_string()))?;
        transcript.push(ChatMessage::assistant(&text));
        Ok((text, begun.elapsed()))
    }

    async fn wait_if_paused(
        &self,
        handle: &AgentHandle,
        state: &mut AgentState,
    ) -> Result<(), RunFailure> {
        let mut paused = handle.pause.subscribe();
        if !*paused.borrow() {
            return Ok(());
        }
        *state = self.apply(handle, *state, Signal::Pause)?;
        info!("agent paused");
        tokio::select! {
            _ = handle.cancel.cancelled() => return Err(RunFailure::Aborted),
            _ = paused.wait_for(|value| !*value) => {}
        }
        *state = self.apply(handle, *state, Signal::Resume)?;
        info!("agent resumed");
        Ok(())
    }

    fn check_budgets(
        &self,
        context: &AgentContext,
        log: &StepLog,
        started: Instant,
    ) -> Result<(), RunFailure> {
        if started.elapsed() >= context.max_duration {
            return Err(RunFailure::TimeBudgetExhausted);
        }
        if log.len() >= context.max_steps {
            return Err(RunFailure::StepBudgetExhausted);
        }
        Ok(())
    }

    fn record(
        &self,
        handle: &AgentHandle,
        log: &mut StepLog,
        kind: StepKind,
        content: impl Into<String>,
        duration: Duration,
        metadata: Value,
    ) {
        let id = log.append(kind, content, duration, metadata);
        handle.emit(AgentEvent::StepRecorded { step_id: id });
        if self.options.consolidate_every > 0 && log.len() % self.options.consolidate_every == 0 {
            debug!(steps = log.len(), "triggering context consolidation");
            let memory = Arc::clone(&self.memory);
            tokio::spawn(async move { memory.consolidate().await });
        }
    }

    fn apply(
        &self,
        handle: &AgentHandle,
        state: AgentState,
        signal: Signal,
    ) -> Result<AgentState, RunFailure> {
        let (next, events) = transition(state, signal).map_err(internal)?;
        debug!(from = ?state, to = ?next, "agent state changed");
        for event in events {
            handle.emit(event);
        }
        Ok(next)
    }
}

fn internal(err: impl std::fmt::Display) -> RunFailure {
    RunFailure::Internal(err.to_string())
}
