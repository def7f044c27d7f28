use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

/// Context a tool call executes under. Kept minimal; the workspace root is the
/// only thing tools universally need.
pub struct ToolContext {
    pub workspace_root: std::path::PathBuf,
}

/// Result of one tool invocation. `content` may be truncated by the core
/// before it is persisted if it exceeds a configured ceiling.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub content: String,
    pub error_message: Option<String>,
    pub metadata: Value,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error_message: None,
            metadata: Value::Null,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            error_message: Some(message.into()),
            metadata: Value::Null,
        }
    }

    /// Truncates `content` to `limit` bytes, matching the core's ceiling policy.
    pub fn truncated(mut self, limit: usize) -> Self {
        if self.content.len() > limit {
            self.content.truncate(limit);
            self.content.push_str("…[truncated]");
        }
        self
    }
}

#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn execute(&self, name: &str, input: Value, ctx: &ToolContext) -> ToolOutcome;
}

type ToolFn = Box<dyn Fn(Value) -> ToolOutcome + Send + Sync>;

/// Fixed-table tool registry for tests and demos, keyed by tool name.
#[derive(Default)]
pub struct InMemoryToolRegistry {
    tools: Mutex<HashMap<String, ToolFn>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, f: impl Fn(Value) -> ToolOutcome + Send + Sync + 'static) {
        self.tools.lock().expect("tool registry mutex poisoned").insert(name.into(), Box::new(f));
    }
}

#[async_trait]
impl ToolRegistry for InMemoryToolRegistry {
    async fn execute(&self, name: &str, input: Value, _ctx: &ToolContext) -> ToolOutcome {
        let tools = self.tools.lock().expect("tool registry mutex poisoned");
        match tools.get(name) {
            Some(f) => f(input),
            None => ToolOutcome::error(format!("no tool registered under name '{name}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_tool_reports_error() {
        let registry = InMemoryToolRegistry::new();
        let ctx = ToolContext { workspace_root: "/tmp".into() };
        let outcome = registry.execute("missing", Value::Null, &ctx).await;
        assert!(outcome.error_message.is_some());
    }

    #[tokio::test]
    async fn registered_tool_runs() {
        let registry = InMemoryToolRegistry::new();
        registry.register("echo", |input| ToolOutcome::ok(input.to_string()));
        let ctx = ToolContext { workspace_root: "/tmp".into() };
        let outcome = registry.execute("echo", serde_json::json!({"a": 1}), &ctx).await;
        assert_eq!(outcome.content, "{\"a\":1}");
    }

    #[test]
    fn outcome_truncation_appends_marker() {
        let outcome = ToolOutcome::ok("x".repeat(100)).truncated(10);
        assert!(outcome.content.len() > 10);
        assert!(outcome.content.starts_with("xxxxxxxxxx"));
        assert!(outcome.content.ends_with("[truncated]"));
    }
}
