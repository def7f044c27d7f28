//! Top-level iteration driver.
//!
//! One "iteration" is render → schedule → settle → persist-frame → bump-counter,
//! in that strict order. Generalises a single agent-process run loop (spawn
//! work, stream, check a terminal condition) to the full render/settle/persist
//! cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use smithers_common::errors::{AgentError, StoreError};
use smithers_common::model::AgentRunStatus;
use tokio_util::sync::CancellationToken;

use tracing::Instrument;

use crate::interfaces::{AgentContext, AgentExecutor, ExecutionLogWriter};
use crate::phase_registry::PhaseRegistry;
use crate::reconciler::{is_stalled, Node, NodeKind, NodeState, Reconciler};
use crate::store::Store;
use crate::supersmithers::{RewriteContext, RewriteOutcome, SuperSmithers, Triggers};

pub struct RalphConfig {
    pub max_iterations: u32,
    pub global_timeout_ms: Option<u64>,
    pub on_iteration: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    pub snapshot_before_start: bool,
    /// K in "tree XML byte-identical for the last K consecutive iterations",
    /// the natural-quiescence termination condition.
    pub stall_k: usize,
    /// How many trailing `RenderFrame`s to keep in memory for stall detection;
    /// older frames stay durable in the Store but drop out of this window.
    pub render_frame_retention: usize,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            global_timeout_ms: None,
            on_iteration: None,
            snapshot_before_start: false,
            stall_k: 3,
            render_frame_retention: 50,
        }
    }
}

/// Binds a `SuperSmithers` pipeline to the scope it observes. One `RalphLoop`
/// carries at most one observer (the single branded-proxy subtree a demo or
/// test wires up); nothing stops an integration from running several loops
/// each with their own.
pub struct RalphObserver {
    pub supersmithers: SuperSmithers,
    pub module_hash: String,
    pub baseline_source: String,
    pub triggers: Triggers,
    /// Fires with the newly activated version id right after a successful
    /// rewrite, before the scope bump forces a remount. Since there is no
    /// runtime module loader, the integrator uses this to register the
    /// compiled overlay factory under that id in time for the next render.
    pub on_rewrite: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl RalphObserver {
    fn triggered(&self, stalled: bool, ctx: &RewriteContext) -> bool {
        if self.triggers.stalls && stalled {
            return true;
        }
        if let Some(ceiling) = self.triggers.token_ceiling {
            if ctx.tokens >= ceiling {
                return true;
            }
        }
        if let Some(threshold) = self.triggers.error_rate_threshold {
            if ctx.agent_count > 0 && (ctx.error_count as f64 / ctx.agent_count as f64) >= threshold {
                return true;
            }
        }
        false
    }
}

enum IterationOutcome {
    Continue(u32),
    Stop(StopReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Stop(String),
    AllPhasesTerminal,
    NaturalQuiescence,
    MaxIterationsReached,
    GlobalTimeoutElapsed,
    Interrupted,
}

/// Drives one Execution's render/settle/persist cycle until a termination
/// condition is met or it is cancelled.
pub struct RalphLoop {
    store: Arc<dyn Store>,
    executor: Arc<dyn AgentExecutor>,
    reconciler: Reconciler,
    config: RalphConfig,
    execution_id: String,
    cancel: CancellationToken,
    recent_frames: Vec<String>,
    next_sequence: i64,
    log: Option<Arc<ExecutionLogWriter>>,
    observer: Option<RalphObserver>,
}

impl RalphLoop {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn AgentExecutor>,
        execution_id: impl Into<String>,
        config: RalphConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            executor,
            reconciler: Reconciler::new(),
            config,
            execution_id: execution_id.into(),
            cancel,
            recent_frames: Vec::new(),
            next_sequence: 0,
            log: None,
            observer: None,
        }
    }

    /// Wires a `SuperSmithers` observer scoped to `module_hash`. Every
    /// iteration assembles a `RewriteContext` from this Execution's durable
    /// history and offers it to `SuperSmithers::maybe_rewrite`; a successful
    /// rewrite bumps the scope revision (§4.6 step 6) so the reconciler
    /// remounts the overlay's subtree on the next render.
    pub fn with_observer(mut self, observer: RalphObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Wires per-execution NDJSON log persistence into every `AgentContext`
    /// this loop builds. Without this, agent runs still work —
    /// `AgentContext::new` leaves `log` as `None`.
    pub fn with_log(mut self, log: Arc<ExecutionLogWriter>) -> Self {
        self.log = Some(log);
        self
    }

    /// Resumes `ralphCount` and recent frame history from the Store. Any
    /// AgentRun left `streaming`/`continuing` from a prior process did not
    /// survive the restart and is marked `failed` before the first re-render.
    pub fn resume(&mut self) -> Result<u32, StoreError> {
        for status in [AgentRunStatus::Streaming, AgentRunStatus::Continuing] {
            self.store.run(
                "UPDATE agent_runs SET status = 'failed', error = 'interrupted' WHERE execution_id = ?1 AND status = ?2",
                &[self.execution_id.as_str().into(), status.as_str().into()],
            )?;
        }
        let count = self
            .store
            .query_one(
                "SELECT value_json FROM state_entries WHERE execution_id = ?1 AND key = 'ralphCount'",
                &[self.execution_id.as_str().into()],
            )?
            .and_then(|r| r.get_json("value_json"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;

        let frames = self.store.query(
            "SELECT sequence_number, tree_xml FROM render_frames WHERE execution_id = ?1 ORDER BY sequence_number ASC",
            &[self.execution_id.as_str().into()],
        )?;
        self.next_sequence = frames
            .iter()
            .filter_map(|r| r.get_i64("sequence_number"))
            .max()
            .map(|n| n + 1)
            .unwrap_or(0);
        self.recent_frames = frames
            .into_iter()
            .filter_map(|r| r.get_text("tree_xml").map(str::to_string))
            .collect();
        if self.recent_frames.len() > self.config.render_frame_retention {
            let overflow = self.recent_frames.len() - self.config.render_frame_retention;
            self.recent_frames.drain(0..overflow);
        }
        Ok(count)
    }

    /// Runs iterations until termination, calling `render` once per iteration to
    /// obtain the author's current tree.
    pub async fn run(
        &mut self,
        mut ralph_count: u32,
        mut render: impl FnMut(u32) -> Node,
        phases: &mut PhaseRegistry,
    ) -> Result<StopReason, StoreError> {
        let deadline = self
            .config
            .global_timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        loop {
            if self.cancel.is_cancelled() {
                self.cancel_all_in_flight()?;
                return Ok(StopReason::Interrupted);
            }

            let active_phase_id = phases.active_phase().unwrap_or("-").to_string();
            let span = tracing::info_span!(
                "ralph_iteration",
                execution_id = %self.execution_id,
                iteration = ralph_count,
                phase_id = %active_phase_id,
            );
            let outcome = self
                .run_iteration(ralph_count, &mut render, phases, deadline)
                .instrument(span)
                .await?;
            match outcome {
                IterationOutcome::Continue(next_count) => ralph_count = next_count,
                IterationOutcome::Stop(reason) => return Ok(reason),
            }
        }
    }

    /// One render → schedule → settle → persist-frame → bump-counter cycle;
    /// the per-iteration span (execution_id, iteration, phase_id) is applied
    /// by the caller via `Instrument`.
    async fn run_iteration(
        &mut self,
        ralph_count: u32,
        render: &mut impl FnMut(u32) -> Node,
        phases: &mut PhaseRegistry,
        deadline: Option<Instant>,
    ) -> Result<IterationOutcome, StoreError> {
        // Step 1: render.
        let tree = render(ralph_count);

        // Step 2: schedule newly-mounted async work.
        let events = self.reconciler.reconcile(&tree);
        for node_id in &events.mounted {
            self.schedule_if_agent(&tree, node_id).await?;
        }
        for node_id in &events.unmounted {
            self.cancel_node(node_id.as_str())?;
        }

        // Step 3: settle.
        self.settle().await?;

        // Step 4: persist a RenderFrame.
        let xml = self.reconciler.render_xml(&tree);
        let sequence_number = self.next_sequence;
        self.store.run(
            "INSERT INTO render_frames (execution_id, sequence_number, tree_xml, created_at) VALUES (?1, ?2, ?3, ?4)",
            &[
                self.execution_id.as_str().into(),
                sequence_number.into(),
                xml.as_str().into(),
                Utc::now().to_rfc3339().into(),
            ],
        )?;
        self.next_sequence += 1;
        self.recent_frames.push(xml.clone());
        if self.recent_frames.len() > self.config.render_frame_retention {
            self.recent_frames.remove(0);
        }

        // Step 5: bump ralphCount.
        let ralph_count = ralph_count + 1;
        self.set_state("ralphCount", serde_json::json!(ralph_count), "ralph_loop")?;
        if let Some(cb) = &self.config.on_iteration {
            cb(ralph_count);
        }
        tracing::debug!(ralph_count, "iteration settled");

        // Phase advancement, evaluated once per iteration after settle.
        let all_children_terminal = |_phase_id: &str| {
            // Only the active phase's mounted subtree matters; the reconciler
            // tracks per-node state, so "terminal" means no in-flight agent
            // work remains anywhere (settle already guarantees this).
            true
        };
        phases.advance(|phase_id| phase_skip(&tree, phase_id), all_children_terminal)?;

        // SuperSmithers observer: offered a chance to analyse/rewrite before the
        // stall-based termination check below could end the loop on this same
        // iteration. A successful rewrite bumps the scope revision (§4.6 step 6)
        // so the reconciler remounts the overlay's subtree on the next render;
        // the natural-quiescence check is suppressed for this one iteration so
        // that remount actually gets a render to happen on.
        let stalled = is_stalled(&self.recent_frames, self.config.stall_k);
        let mut suppress_stall_termination = false;
        if let Some(observer) = self.observer.as_mut() {
            let rewrite_ctx = build_rewrite_context(
                self.store.as_ref(),
                &self.execution_id,
                &observer.module_hash,
                &observer.baseline_source,
                &xml,
                &self.recent_frames,
            )?;
            let triggered = observer.triggered(stalled, &rewrite_ctx);
            match observer.supersmithers.maybe_rewrite(triggered, rewrite_ctx).await {
                Ok(RewriteOutcome::Rewrote { version_id }) => {
                    tracing::info!(version_id = %version_id, "supersmithers rewrite activated, forcing remount");
                    if let Some(hook) = &observer.on_rewrite {
                        hook(&version_id);
                    }
                    self.reconciler.bump_scope_rev();
                    self.store.run(
                        "UPDATE executions SET scope_rev = scope_rev + 1 WHERE id = ?1",
                        &[self.execution_id.as_str().into()],
                    )?;
                    suppress_stall_termination = true;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "supersmithers observer failed");
                }
            }
        }

        // Step 6: termination check.
        if let Some(reason) = self.find_stop(&tree) {
            return Ok(IterationOutcome::Stop(StopReason::Stop(reason)));
        }
        if phases.all_terminal() {
            return Ok(IterationOutcome::Stop(StopReason::AllPhasesTerminal));
        }
        if stalled && !suppress_stall_termination {
            return Ok(IterationOutcome::Stop(StopReason::NaturalQuiescence));
        }
        if ralph_count >= self.config.max_iterations {
            return Ok(IterationOutcome::Stop(StopReason::MaxIterationsReached));
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Ok(IterationOutcome::Stop(StopReason::GlobalTimeoutElapsed));
            }
        }
        Ok(IterationOutcome::Continue(ralph_count))
    }

    fn find_stop(&self, node: &Node) -> Option<String> {
        if let NodeKind::Stop { reason } = &node.kind {
            return Some(reason.clone());
        }
        node.children.iter().find_map(|c| self.find_stop(c))
    }

    async fn schedule_if_agent(&mut self, tree: &Node, node_id: &crate::reconciler::NodeId) -> Result<(), StoreError> {
        let Some(agent_node) = find_node(tree, node_id) else { return Ok(()) };
        let NodeKind::Agent { prompt, model, allowed_tools } = &agent_node.kind else { return Ok(()) };

        let existing = self
            .store
            .query_one("SELECT status FROM agent_runs WHERE id = ?1", &[node_id.as_str().into()])?;
        if existing.is_none() {
            self.store.run(
                "INSERT INTO agent_runs (id, execution_id, prompt, model, allowed_tools, status, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                &[
                    node_id.as_str().into(),
                    self.execution_id.as_str().into(),
                    prompt.as_str().into(),
                    model.as_str().into(),
                    serde_json::to_string(allowed_tools).unwrap_or_default().into(),
                    AgentRunStatus::Pending.as_str().into(),
                    Utc::now().to_rfc3339().into(),
                ],
            )?;
        }

        let run_row = self
            .store
            .query_one(
                "SELECT id, execution_id, phase_id, step_id, prompt, model, allowed_tools, status, tokens_input, tokens_output, error, created_at FROM agent_runs WHERE id = ?1",
                &[node_id.as_str().into()],
            )?
            .expect("agent_run row was just inserted or already present");
        let run = row_to_agent_run(&run_row);

        let ctx = match &self.log {
            Some(log) => AgentContext::with_log(self.store.clone(), log.clone()),
            None => AgentContext::new(self.store.clone()),
        };
        self.executor
            .start(&run, &ctx)
            .await
            .map_err(|e: AgentError| StoreError::with_source(
                smithers_common::errors::StoreErrorKind::Io,
                "agent executor start failed",
                e.into(),
            ))?;
        self.reconciler.set_node_state(node_id, NodeState::Running);
        Ok(())
    }

    fn cancel_node(&self, node_id: &str) -> Result<(), StoreError> {
        self.store.run(
            "UPDATE agent_runs SET status = 'cancelled' WHERE id = ?1 AND status NOT IN ('completed','failed','cancelled')",
            &[node_id.into()],
        )?;
        Ok(())
    }

    fn cancel_all_in_flight(&self) -> Result<(), StoreError> {
        self.store.run(
            "UPDATE agent_runs SET status = 'cancelled' WHERE execution_id = ?1 AND status NOT IN ('completed','failed','cancelled')",
            &[self.execution_id.as_str().into()],
        )?;
        self.store.run(
            "UPDATE executions SET status = 'interrupted', ended_at = ?1 WHERE id = ?2",
            &[Utc::now().to_rfc3339().into(), self.execution_id.as_str().into()],
        )?;
        Ok(())
    }

    /// Waits until no AgentRun for this Execution is in a non-terminal state.
    /// Cooperative: yields between wake-ups rather than busy-spinning.
    async fn settle(&self) -> Result<(), StoreError> {
        const MAX_TICKS: u32 = 2000;
        for _ in 0..MAX_TICKS {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let rows = self.store.query(
                "SELECT COUNT(*) as n FROM agent_runs WHERE execution_id = ?1 AND status IN ('pending','streaming','tools','continuing')",
                &[self.execution_id.as_str().into()],
            )?;
            let in_flight = rows.first().and_then(|r| r.get_i64("n")).unwrap_or(0);
            if in_flight == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }

    fn set_state(&self, key: &str, value: serde_json::Value, trigger: &str) -> Result<(), StoreError> {
        let previous = self
            .store
            .query_one(
                "SELECT value_json FROM state_entries WHERE execution_id = ?1 AND key = ?2",
                &[self.execution_id.as_str().into(), key.into()],
            )?
            .and_then(|r| r.get_json("value_json"));
        let now = Utc::now().to_rfc3339();
        self.store.run(
            "INSERT INTO state_entries (execution_id, key, value_json, updated_at) VALUES (?1,?2,?3,?4)
             ON CONFLICT(execution_id, key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            &[
                self.execution_id.as_str().into(),
                key.into(),
                value.to_string().into(),
                now.as_str().into(),
            ],
        )?;
        self.store.run(
            "INSERT INTO state_transitions (execution_id, key, old_json, new_json, trigger, at) VALUES (?1,?2,?3,?4,?5,?6)",
            &[
                self.execution_id.as_str().into(),
                key.into(),
                previous.map(|v| v.to_string()).into(),
                value.to_string().into(),
                trigger.into(),
                now.into(),
            ],
        )?;
        Ok(())
    }
}

/// Looks up a direct Phase child of the rendered tree by its node key (a
/// Phase's key is always its durable phase id, per the author-facing builder)
/// and reports whether that render evaluated its `skipIf` to true.
fn phase_skip(tree: &Node, phase_id: &str) -> bool {
    tree.children
        .iter()
        .find(|c| c.key.as_deref() == Some(phase_id))
        .is_some_and(|c| matches!(&c.kind, NodeKind::Phase { skip, .. } if *skip))
}

/// Assembles a `RewriteContext` from this Execution's durable `agent_runs`
/// history plus the in-memory render-frame window. `module_hash` and
/// `baseline_source` come from the observer binding, not the Store, since the
/// baseline is the author's original source rather than anything persisted.
fn build_rewrite_context(
    store: &dyn Store,
    execution_id: &str,
    module_hash: &str,
    baseline_source: &str,
    tree_xml: &str,
    recent_frames: &[String],
) -> Result<RewriteContext, StoreError> {
    let agent_count = store
        .query_one(
            "SELECT COUNT(*) as n FROM agent_runs WHERE execution_id = ?1",
            &[execution_id.into()],
        )?
        .and_then(|r| r.get_i64("n"))
        .unwrap_or(0);
    let error_count = store
        .query_one(
            "SELECT COUNT(*) as n FROM agent_runs WHERE execution_id = ?1 AND status = 'failed'",
            &[execution_id.into()],
        )?
        .and_then(|r| r.get_i64("n"))
        .unwrap_or(0);
    let tokens = store
        .query_one(
            "SELECT COALESCE(SUM(tokens_input), 0) + COALESCE(SUM(tokens_output), 0) as n FROM agent_runs WHERE execution_id = ?1",
            &[execution_id.into()],
        )?
        .and_then(|r| r.get_i64("n"))
        .unwrap_or(0);
    let last_errors = store
        .query(
            "SELECT error FROM agent_runs WHERE execution_id = ?1 AND error IS NOT NULL ORDER BY created_at DESC LIMIT 10",
            &[execution_id.into()],
        )?
        .iter()
        .filter_map(|r| r.get_text("error").map(str::to_string))
        .collect();
    let stall_count = trailing_identical_count(recent_frames);
    let last_frames = recent_frames
        .iter()
        .rev()
        .take(10)
        .rev()
        .cloned()
        .collect();

    Ok(RewriteContext {
        module_hash: module_hash.to_string(),
        tokens,
        agent_count,
        error_count,
        stall_count,
        last_errors,
        last_frames,
        tree_xml: tree_xml.to_string(),
        baseline_source: baseline_source.to_string(),
    })
}

/// Counts how many of the trailing render frames are byte-identical to the
/// last one; `0` when there is no history yet.
fn trailing_identical_count(frames: &[String]) -> i64 {
    let Some(last) = frames.last() else { return 0 };
    frames.iter().rev().take_while(|f| *f == last).count() as i64
}

fn find_node<'a>(node: &'a Node, target: &crate::reconciler::NodeId) -> Option<&'a Node> {
    // Identity is positional; recompute alongside the same walk order the
    // reconciler uses so this lookup agrees with `reconcile`'s ids.
    fn walk<'a>(
        node: &'a Node,
        parent: Option<&crate::reconciler::NodeId>,
        position: usize,
        target: &crate::reconciler::NodeId,
    ) -> Option<&'a Node> {
        let id = crate::reconciler::NodeId::compute(parent, position, node.kind.tag(), node.key.as_deref());
        if &id == target {
            return Some(node);
        }
        for (i, child) in node.children.iter().enumerate() {
            if let Some(found) = walk(child, Some(&id), i, target) {
                return Some(found);
            }
        }
        None
    }
    walk(node, None, 0, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::StubAgentExecutor;
    use crate::store::SqliteStore;

    fn seeded_store(execution_id: &str) -> Arc<dyn Store> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .run(
                "INSERT INTO executions (id, name, script_path, status, started_at, created_at) VALUES (?1,'demo','/w','running',?2,?2)",
                &[execution_id.into(), Utc::now().to_rfc3339().into()],
            )
            .unwrap();
        store
    }

    fn phase_node(id: &str, skip: bool, children: Vec<Node>) -> Node {
        Node::new(NodeKind::Phase {
            name: id.to_string(),
            skip,
        })
        .with_key(id.to_string())
        .with_children(children)
    }

    fn agent_node(key: &str) -> Node {
        Node::new(NodeKind::Agent {
            prompt: "say hi".to_string(),
            model: "stub".to_string(),
            allowed_tools: vec![],
        })
        .with_key(key.to_string())
    }

    #[tokio::test]
    async fn runs_sequential_phases_to_all_phases_terminal() {
        let execution_id = "exec-seq";
        let store = seeded_store(execution_id);
        let executor = Arc::new(StubAgentExecutor::fixed("hi"));
        let mut phases = PhaseRegistry::load_or_init(
            store.clone(),
            execution_id,
            &[("a".to_string(), "A".to_string()), ("b".to_string(), "B".to_string())],
        )
        .unwrap();

        let mut loop_ = RalphLoop::new(
            store,
            executor,
            execution_id,
            RalphConfig {
                max_iterations: 20,
                ..Default::default()
            },
            CancellationToken::new(),
        );

        let render = |_n: u32| {
            Node::new(NodeKind::RalphLoop {
                max_iterations: 20,
                global_timeout_ms: None,
                snapshot_before_start: false,
            })
            .with_children(vec![
                phase_node("a", false, vec![agent_node("a-agent")]),
                phase_node("b", false, vec![agent_node("b-agent")]),
            ])
        };

        let reason = loop_.run(0, render, &mut phases).await.unwrap();
        assert_eq!(reason, StopReason::AllPhasesTerminal);
        assert_eq!(phases.status("a"), Some(smithers_common::model::PhaseStatus::Completed));
        assert_eq!(phases.status("b"), Some(smithers_common::model::PhaseStatus::Completed));
    }

    #[tokio::test]
    async fn phase_marked_skip_in_the_tree_is_skipped_not_activated() {
        let execution_id = "exec-skip";
        let store = seeded_store(execution_id);
        let executor = Arc::new(StubAgentExecutor::fixed("hi"));
        let mut phases = PhaseRegistry::load_or_init(
            store.clone(),
            execution_id,
            &[("a".to_string(), "A".to_string()), ("b".to_string(), "B".to_string())],
        )
        .unwrap();

        let mut loop_ = RalphLoop::new(
            store,
            executor,
            execution_id,
            RalphConfig {
                max_iterations: 20,
                ..Default::default()
            },
            CancellationToken::new(),
        );

        let render = |_n: u32| {
            Node::new(NodeKind::RalphLoop {
                max_iterations: 20,
                global_timeout_ms: None,
                snapshot_before_start: false,
            })
            .with_children(vec![
                phase_node("a", true, vec![]),
                phase_node("b", false, vec![agent_node("b-agent")]),
            ])
        };

        let reason = loop_.run(0, render, &mut phases).await.unwrap();
        assert_eq!(reason, StopReason::AllPhasesTerminal);
        assert_eq!(phases.status("a"), Some(smithers_common::model::PhaseStatus::Skipped));
        assert_eq!(phases.status("b"), Some(smithers_common::model::PhaseStatus::Completed));
    }

    #[tokio::test]
    async fn stop_node_terminates_immediately_with_its_reason() {
        let execution_id = "exec-stop";
        let store = seeded_store(execution_id);
        let executor = Arc::new(StubAgentExecutor::fixed("hi"));
        let mut phases = PhaseRegistry::load_or_init(store.clone(), execution_id, &[]).unwrap();

        let mut loop_ = RalphLoop::new(
            store,
            executor,
            execution_id,
            RalphConfig {
                max_iterations: 20,
                ..Default::default()
            },
            CancellationToken::new(),
        );

        let render = |_n: u32| {
            Node::new(NodeKind::RalphLoop {
                max_iterations: 20,
                global_timeout_ms: None,
                snapshot_before_start: false,
            })
            .with_children(vec![Node::new(NodeKind::Stop {
                reason: "done".to_string(),
            })])
        };

        let reason = loop_.run(0, render, &mut phases).await.unwrap();
        assert_eq!(reason, StopReason::Stop("done".to_string()));
    }

    #[tokio::test]
    async fn max_iterations_bounds_a_slow_moving_phase_chain() {
        let execution_id = "exec-bound";
        let store = seeded_store(execution_id);
        let executor = Arc::new(StubAgentExecutor::fixed("hi"));
        // 10 phases complete one per iteration (see phase_registry::advance); with
        // max_iterations capped at 3 the chain cannot reach AllPhasesTerminal.
        let declared: Vec<(String, String)> = (0..10).map(|i| (format!("p{i}"), format!("P{i}"))).collect();
        let mut phases = PhaseRegistry::load_or_init(store.clone(), execution_id, &declared).unwrap();

        let mut loop_ = RalphLoop::new(
            store,
            executor,
            execution_id,
            RalphConfig {
                max_iterations: 3,
                stall_k: 10_000,
                ..Default::default()
            },
            CancellationToken::new(),
        );

        let render = |_n: u32| {
            let children = (0..10).map(|i| phase_node(&format!("p{i}"), false, vec![])).collect();
            Node::new(NodeKind::RalphLoop {
                max_iterations: 3,
                global_timeout_ms: None,
                snapshot_before_start: false,
            })
            .with_children(children)
        };

        let reason = loop_.run(0, render, &mut phases).await.unwrap();
        assert_eq!(reason, StopReason::MaxIterationsReached);
    }

    #[tokio::test]
    async fn resume_marks_interrupted_agent_runs_failed() {
        let execution_id = "exec-resume";
        let store = seeded_store(execution_id);
        store
            .run(
                "INSERT INTO agent_runs (id, execution_id, prompt, model, status, created_at) VALUES ('r1',?1,'p','m','streaming',?2)",
                &[execution_id.into(), Utc::now().to_rfc3339().into()],
            )
            .unwrap();

        let executor = Arc::new(StubAgentExecutor::fixed("hi"));
        let mut loop_ = RalphLoop::new(
            store.clone(),
            executor,
            execution_id,
            RalphConfig::default(),
            CancellationToken::new(),
        );
        let count = loop_.resume().unwrap();
        assert_eq!(count, 0);

        let row = store.query_one("SELECT status, error FROM agent_runs WHERE id = 'r1'", &[]).unwrap().unwrap();
        assert_eq!(row.get_text("status"), Some("failed"));
        assert_eq!(row.get_text("error"), Some("interrupted"));
    }
}

fn row_to_agent_run(row: &crate::store::Row) -> smithers_common::model::AgentRun {
    smithers_common::model::AgentRun {
        id: row.get_text("id").unwrap_or_default().to_string(),
        execution_id: row.get_text("execution_id").unwrap_or_default().to_string(),
        phase_id: row.get_text("phase_id").map(str::to_string),
        step_id: row.get_text("step_id").map(str::to_string),
        prompt: row.get_text("prompt").unwrap_or_default().to_string(),
        model: row.get_text("model").unwrap_or_default().to_string(),
        allowed_tools: row
            .get_text("allowed_tools")
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default(),
        status: row
            .get_text("status")
            .and_then(AgentRunStatus::parse)
            .unwrap_or(AgentRunStatus::Pending),
        tokens_input: row.get_i64("tokens_input"),
        tokens_output: row.get_i64("tokens_output"),
        error: row.get_text("error").map(str::to_string),
        created_at: row
            .get_text("created_at")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
    }
}
