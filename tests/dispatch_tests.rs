// Tool dispatch tests - registry contracts and concurrency behavior
//
// Tests cover duplicate registration, unknown tools, provider precedence,
// the per-call timeout, and the fair concurrency cap.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strategos::application::tooling::{
    tool_fn, DispatchError, DispatcherOptions, RegistryError, ToolProvider, ToolRegistry,
};
use strategos::infrastructure::protocol::{ToolDescriptor, ToolResult};
use tokio_util::sync::CancellationToken;

fn descriptor(name: &str) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: None,
        input_schema: None,
    }
}

struct FixedProvider {
    name: String,
    tools: Vec<String>,
    reply: String,
}

impl FixedProvider {
    fn new(name: &str, tools: &[&str], reply: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools: tools.iter().map(|tool| tool.to_string()).collect(),
            reply: reply.to_string(),
        })
    }
}

#[async_trait]
impl ToolProvider for FixedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn catalog(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|tool| descriptor(tool)).collect()
    }

    async fn call(
        &self,
        _tool: &str,
        _arguments: Value,
        _cancel: &CancellationToken,
    ) -> Result<ToolResult, DispatchError> {
        Ok(ToolResult::text(self.reply.clone()))
    }
}

#[tokio::test]
async fn duplicate_registration_is_rejected_and_first_wins() {
    let registry = ToolRegistry::new(DispatcherOptions::default());
    registry
        .register(
            descriptor("greet"),
            tool_fn(|_| async { Ok(ToolResult::text("first")) }),
        )
        .expect("first registration");

    let second = registry.register(
        descriptor("greet"),
        tool_fn(|_| async { Ok(ToolResult::text("second")) }),
    );
    assert!(matches!(second, Err(RegistryError::DuplicateName(name)) if name == "greet"));

    let result = registry.dispatch("greet", json!({})).await.expect("dispatch");
    assert_eq!(result.first_text(), Some("first"));
}

#[tokio::test]
async fn unknown_tool_is_not_found() {
    let registry = ToolRegistry::new(DispatcherOptions::default());
    let err = registry
        .dispatch("ghost", json!({}))
        .await
        .expect_err("must fail");
    assert!(matches!(err, DispatchError::NotFound(name) if name == "ghost"));
}

#[tokio::test]
async fn local_registration_shadows_providers() {
    let registry = ToolRegistry::new(DispatcherOptions::default());
    registry.add_provider(FixedProvider::new("remote", &["shared"], "from remote"));
    registry
        .register(
            descriptor("shared"),
            tool_fn(|_| async { Ok(ToolResult::text("from local")) }),
        )
        .expect("register local");

    let result = registry
        .dispatch("shared", json!({}))
        .await
        .expect("dispatch");
    assert_eq!(result.first_text(), Some("from local"));
}

#[tokio::test]
async fn first_matching_provider_wins_in_registration_order() {
    let registry = ToolRegistry::new(DispatcherOptions::default());
    registry.add_provider(FixedProvider::new("alpha", &["shared"], "from alpha"));
    registry.add_provider(FixedProvider::new("beta", &["shared", "extra"], "from beta"));

    let shared = registry
        .dispatch("shared", json!({}))
        .await
        .expect("dispatch shared");
    assert_eq!(shared.first_text(), Some("from alpha"));

    // A name only the later provider carries still reaches it.
    let extra = registry
        .dispatch("extra", json!({}))
        .await
        .expect("dispatch extra");
    assert_eq!(extra.first_text(), Some("from beta"));
}

#[tokio::test]
async fn handler_failure_becomes_an_erroneous_result() {
    let registry = ToolRegistry::new(DispatcherOptions::default());
    registry
        .register(
            descriptor("fragile"),
            tool_fn(|_| async {
                Err(strategos::application::tooling::HandlerError::new(
                    "disk on fire",
                ))
            }),
        )
        .expect("register fragile");

    let result = registry
        .dispatch("fragile", json!({}))
        .await
        .expect("dispatch still succeeds");
    assert!(result.is_error);
    assert!(result.first_text().unwrap().contains("disk on fire"));
}

#[tokio::test]
async fn per_call_timeout_fails_the_call_not_the_dispatcher() {
    let registry = ToolRegistry::new(DispatcherOptions {
        max_concurrent: 3,
        call_timeout: Duration::from_millis(50),
    });
    registry
        .register(
            descriptor("sleepy"),
            tool_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ToolResult::text("too late"))
            }),
        )
        .expect("register sleepy");
    registry
        .register(
            descriptor("quick"),
            tool_fn(|_| async { Ok(ToolResult::text("fast")) }),
        )
        .expect("register quick");

    let err = registry
        .dispatch("sleepy", json!({}))
        .await
        .expect_err("must time out");
    assert!(matches!(err, DispatchError::Timeout { .. }));

    // The dispatcher keeps serving other tools afterwards.
    let result = registry.dispatch("quick", json!({})).await.expect("dispatch");
    assert_eq!(result.first_text(), Some("fast"));
}

#[tokio::test]
async fn closed_registry_rejects_dispatch_without_panicking() {
    let registry = ToolRegistry::new(DispatcherOptions::default());
    registry
        .register(
            descriptor("greet"),
            tool_fn(|_| async { Ok(ToolResult::text("hi")) }),
        )
        .expect("register greet");

    registry.close();

    let err = registry
        .dispatch("greet", json!({}))
        .await
        .expect_err("must be rejected");
    assert!(matches!(err, DispatchError::Cancelled { tool } if tool == "greet"));
}

#[tokio::test]
async fn concurrency_never_exceeds_the_cap() {
    let cap = 2;
    let calls = 6;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let registry = Arc::new(ToolRegistry::new(DispatcherOptions {
        max_concurrent: cap,
        call_timeout: Duration::from_secs(5),
    }));
    let probe_running = Arc::clone(&running);
    let probe_peak = Arc::clone(&peak);
    registry
        .register(
            descriptor("probe"),
            tool_fn(move |_| {
                let running = Arc::clone(&probe_running);
                let peak = Arc::clone(&probe_peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(ToolResult::text("done"))
                }
            }),
        )
        .expect("register probe");

    let mut tasks = Vec::new();
    for _ in 0..calls {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.dispatch("probe", json!({})).await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("dispatch");
    }

    assert!(peak.load(Ordering::SeqCst) <= cap);
    assert_eq!(running.load(Ordering::SeqCst), 0);
}
