use crate::application::agent::AgentOutcome;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session storage failed: {0}")]
    Storage(String),
}

/// Run-boundary persistence. Called once per run after the terminal state
/// is reached; never consulted mid-loop.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, outcome: AgentOutcome) -> Result<(), SessionError>;

    async fn load(&self, run_id: &str) -> Result<Option<AgentOutcome>, SessionError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    runs: Mutex<HashMap<String, AgentOutcome>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, outcome: AgentOutcome) -> Result<(), SessionError> {
        self.runs
            .lock()
            .await
            .insert(outcome.run_id.clone(), outcome);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<AgentOutcome>, SessionError> {
        Ok(self.runs.lock().await.get(run_id).cloned())
    }
}
