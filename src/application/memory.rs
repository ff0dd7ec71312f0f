use async_trait::async_trait;

/// One remembered item, already trimmed to fit the caller's budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextItem {
    pub content: String,
    pub relevance: f64,
}

/// External memory collaborator. `consolidate` must be idempotent; the agent
/// fires it periodically and never waits on the outcome.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn relevant_context(&self, query: &str, budget: usize) -> Vec<ContextItem>;

    async fn consolidate(&self);
}

/// Context provider that remembers nothing. Used when no memory backend is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopContext;

#[async_trait]
impl ContextProvider for NoopContext {
    async fn relevant_context(&self, _query: &str, _budget: usize) -> Vec<ContextItem> {
        Vec::new()
    }

    async fn consolidate(&self) {}
}
