use std::sync::Arc;

use async_trait::async_trait;
use smithers_common::errors::AgentError;
use smithers_common::model::AgentRun;

use crate::interfaces::exec_log::{ExecutionLogWriter, StreamEventKind};
use crate::store::Store;

/// Handle to a running (or completed) agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHandle {
    pub agent_run_id: String,
}

/// What an `AgentExecutor` is given to do its work: the Store, so it can
/// write streaming text and tool calls back to the same `AgentRun.id`, and
/// the Execution's NDJSON log writer so chunks and tool calls land in
/// `stream.ndjson` as they arrive. `log` is `None` when the caller has not
/// wired per-execution log persistence (e.g. unit tests).
pub struct AgentContext {
    pub store: Arc<dyn Store>,
    pub log: Option<Arc<ExecutionLogWriter>>,
}

impl AgentContext {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, log: None }
    }

    pub fn with_log(store: Arc<dyn Store>, log: Arc<ExecutionLogWriter>) -> Self {
        Self { store, log: Some(log) }
    }
}

/// The external agent executor contract. `start` is non-blocking: it
/// schedules work and returns a handle immediately. Status only advances
/// forward through `AgentRunStatus` — see `AgentRunStatus::can_advance_to`.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn start(&self, run: &AgentRun, ctx: &AgentContext) -> Result<AgentHandle, AgentError>;

    /// Best-effort termination; no guarantee the underlying work stops before
    /// this returns.
    async fn cancel(&self, handle: &AgentHandle, ctx: &AgentContext);
}

/// Deterministic executor for tests and demos: completes every agent
/// synchronously inside `start`, writing a canned response. The sequential
/// sanity scenario is built against this.
pub struct StubAgentExecutor<F>
where
    F: Fn(&AgentRun) -> String + Send + Sync,
{
    respond: F,
}

impl<F> StubAgentExecutor<F>
where
    F: Fn(&AgentRun) -> String + Send + Sync,
{
    pub fn new(respond: F) -> Self {
        Self { respond }
    }
}

impl StubAgentExecutor<fn(&AgentRun) -> String> {
    /// Always answers with a fixed string, regardless of the prompt.
    pub fn fixed(response: &'static str) -> StubAgentExecutor<impl Fn(&AgentRun) -> String + Send + Sync> {
        StubAgentExecutor::new(move |_run| response.to_string())
    }
}

#[async_trait]
impl<F> AgentExecutor for StubAgentExecutor<F>
where
    F: Fn(&AgentRun) -> String + Send + Sync,
{
    async fn start(&self, run: &AgentRun, ctx: &AgentContext) -> Result<AgentHandle, AgentError> {
        let output = (self.respond)(run);
        ctx.store
            .run(
                "UPDATE agent_runs SET status = ?1, tokens_output = ?2 WHERE id = ?3",
                &[
                    "completed".into(),
                    (output.len() as i64).into(),
                    run.id.as_str().into(),
                ],
            )
            .map_err(|e| AgentError::new(run.id.clone(), format!("stub executor store write failed: {e}")))?;
        if let Some(log) = &ctx.log {
            let _ = log.append(&run.id, StreamEventKind::TextEnd { text: output });
        }
        Ok(AgentHandle {
            agent_run_id: run.id.clone(),
        })
    }

    async fn cancel(&self, handle: &AgentHandle, ctx: &AgentContext) {
        let _ = ctx.store.run(
            "UPDATE agent_runs SET status = 'cancelled' WHERE id = ?1 AND status NOT IN ('completed','failed','cancelled')",
            &[handle.agent_run_id.as_str().into()],
        );
    }
}
