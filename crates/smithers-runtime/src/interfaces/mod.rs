//! External collaborator traits: the agent executor and tool registry. The
//! core never implements a real model client — it depends on these traits
//! and ships deterministic stubs for tests and demos, keeping the boundary
//! between the orchestration core and a subprocess-driven model client.

pub mod agent_executor;
pub mod exec_log;
pub mod tool_registry;

pub use agent_executor::{AgentContext, AgentExecutor, AgentHandle, StubAgentExecutor};
pub use exec_log::{ExecutionLogWriter, StreamEventKind, StreamSummary};
pub use tool_registry::{InMemoryToolRegistry, ToolContext, ToolOutcome, ToolRegistry};
