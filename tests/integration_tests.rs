//! End-to-end scenarios against the public `smithers` API: a workflow script
//! (`Plan`/`Phase`/`Agent`) driven through a real `SqliteStore` by `RalphLoop`,
//! exercising the same S1-S6 scenarios and termination conditions a real
//! integration would hit.

use std::sync::Arc;

use assert_cmd::Command;
use chrono::Utc;
use predicates::prelude::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use smithers::component::{self, task, Agent, Phase, Plan};
use smithers::hooks::Ctx;
use smithers::interfaces::StubAgentExecutor;
use smithers::model::PhaseStatus;
use smithers::phase_registry::PhaseRegistry;
use smithers::ralph::{RalphConfig, RalphLoop, RalphObserver, StopReason};
use smithers::reactive::ReactiveQueries;
use smithers::reconciler::NodeKind;
use smithers::store::{SqliteStore, Store};
use smithers::supersmithers::{
    OverlayRegistry, OverlayVcs, RewriteContext, RewriteOutcome, StubAnalyser, StubRewriter, SuperSmithers, Triggers,
};

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

fn ctx_for(store: Arc<dyn Store>, execution_id: &str) -> Ctx {
    let reactive = Arc::new(ReactiveQueries::new(store.clone(), &["state_entries", "state_transitions"]));
    Ctx::new(store, reactive, execution_id)
}

#[tokio::test]
async fn s1_sequential_sanity_completes_both_phases_with_one_agent_run_each() {
    let execution_id = "exec-s1";
    let store = seeded_store(execution_id);
    let ctx = ctx_for(store.clone(), execution_id);

    let plan = Plan::new(5)
        .phase(Phase::new("A").with_children(vec![Agent::new("say hi", "stub").build()]))
        .phase(Phase::new("B").with_children(vec![Agent::new("say bye", "stub").build()]));

    let mut phases = PhaseRegistry::load_or_init(store.clone(), execution_id, &plan.declared_phases()).unwrap();
    plan.register_hooks(&mut phases);

    let executor = Arc::new(StubAgentExecutor::fixed("ok"));
    let mut ralph = RalphLoop::new(
        store.clone(),
        executor,
        execution_id,
        RalphConfig {
            max_iterations: 5,
            ..Default::default()
        },
        CancellationToken::new(),
    );

    let reason = ralph.run(0, |_n| plan.render(&ctx), &mut phases).await.unwrap();
    assert_eq!(reason, StopReason::AllPhasesTerminal);
    assert_eq!(phases.status("A"), Some(PhaseStatus::Completed));
    assert_eq!(phases.status("B"), Some(PhaseStatus::Completed));

    let runs = store
        .query("SELECT status FROM agent_runs WHERE execution_id = ?1", &[execution_id.into()])
        .unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.get_text("status") == Some("completed")));
}

#[tokio::test]
async fn s2_skip_marks_phase_b_skipped_with_only_one_agent_run() {
    let execution_id = "exec-s2";
    let store = seeded_store(execution_id);
    let ctx = ctx_for(store.clone(), execution_id);

    let plan = Plan::new(5)
        .phase(Phase::new("A").with_children(vec![Agent::new("say hi", "stub").build()]))
        .phase(Phase::new("B").skip_if(|_ctx| true).with_children(vec![Agent::new("say bye", "stub").build()]));

    let mut phases = PhaseRegistry::load_or_init(store.clone(), execution_id, &plan.declared_phases()).unwrap();
    plan.register_hooks(&mut phases);

    let executor = Arc::new(StubAgentExecutor::fixed("ok"));
    let mut ralph = RalphLoop::new(
        store.clone(),
        executor,
        execution_id,
        RalphConfig {
            max_iterations: 5,
            ..Default::default()
        },
        CancellationToken::new(),
    );

    let reason = ralph.run(0, |_n| plan.render(&ctx), &mut phases).await.unwrap();
    assert_eq!(reason, StopReason::AllPhasesTerminal);
    assert_eq!(phases.status("A"), Some(PhaseStatus::Completed));
    assert_eq!(phases.status("B"), Some(PhaseStatus::Skipped));

    let runs = store
        .query("SELECT id FROM agent_runs WHERE execution_id = ?1", &[execution_id.into()])
        .unwrap();
    assert_eq!(runs.len(), 1, "the skipped phase's agent must never mount");
}

#[tokio::test]
async fn s3_resume_marks_interrupted_agent_run_failed_then_finishes_normally() {
    let execution_id = "exec-s3";
    let store = seeded_store(execution_id);
    let ctx = ctx_for(store.clone(), execution_id);

    let plan = Plan::new(6)
        .phase(Phase::new("A").with_children(vec![Agent::new("say hi", "stub").build()]))
        .phase(Phase::new("B").with_children(vec![Agent::new("say bye", "stub").build()]));

    let mut phases = PhaseRegistry::load_or_init(store.clone(), execution_id, &plan.declared_phases()).unwrap();
    plan.register_hooks(&mut phases);

    // Drive Phase A to `active`, then fabricate the agent run a hard kill would
    // have left mid-flight: mounted, never completed.
    phases.advance(|_| false, |_| true).unwrap();
    assert_eq!(phases.status("A"), Some(PhaseStatus::Active));
    store
        .run(
            "INSERT INTO agent_runs (id, execution_id, prompt, model, status, created_at) VALUES ('stale-a-agent',?1,'say hi','stub','streaming',?2)",
            &[execution_id.into(), Utc::now().to_rfc3339().into()],
        )
        .unwrap();

    let executor = Arc::new(StubAgentExecutor::fixed("ok"));
    let mut ralph = RalphLoop::new(
        store.clone(),
        executor,
        execution_id,
        RalphConfig {
            max_iterations: 6,
            ..Default::default()
        },
        CancellationToken::new(),
    );
    let resumed_count = ralph.resume().unwrap();

    let stale = store
        .query_one("SELECT status, error FROM agent_runs WHERE id = 'stale-a-agent'", &[])
        .unwrap()
        .unwrap();
    assert_eq!(stale.get_text("status"), Some("failed"));
    assert_eq!(stale.get_text("error"), Some("interrupted"));

    // A resumed process reloads the registry the same way, picking up Phase
    // A's still-`active` status straight from the Store.
    let mut phases = PhaseRegistry::load_or_init(store.clone(), execution_id, &plan.declared_phases()).unwrap();
    plan.register_hooks(&mut phases);

    let reason = ralph.run(resumed_count, |_n| plan.render(&ctx), &mut phases).await.unwrap();
    assert_eq!(reason, StopReason::AllPhasesTerminal);
    assert_eq!(phases.status("A"), Some(PhaseStatus::Completed));
    assert_eq!(phases.status("B"), Some(PhaseStatus::Completed));
}

#[tokio::test]
async fn s4_stall_driven_rewrite_swaps_in_an_overlay_and_stops_the_loop() {
    let execution_id = "exec-s4";
    let store = seeded_store(execution_id);
    let ctx = ctx_for(store.clone(), execution_id);
    let registry = Arc::new(OverlayRegistry::new());

    // Non-empty so `all_terminal()` doesn't vacuously end the loop before the
    // observer gets a chance to act.
    let declared: Vec<(String, String)> = (0..5).map(|i| (format!("p{i}"), format!("P{i}"))).collect();
    let mut phases = PhaseRegistry::load_or_init(store.clone(), execution_id, &declared).unwrap();

    let module_path = "/workflow.rs";
    let baseline_source = "baseline source";
    let module_hash = component::module_hash(module_path, baseline_source);

    let vcs_dir = tempfile::tempdir().unwrap();
    let vcs = OverlayVcs::open_or_init(vcs_dir.path()).unwrap();
    {
        let repo = git2::Repository::open(vcs_dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
    }
    let analyser = Arc::new(StubAnalyser { recommended: true });
    let rewriter = Arc::new(StubRewriter {
        new_code: format!("// module_hash: {module_hash}\nfn overlay_factory() {{}}\n"),
    });
    let super_smithers = SuperSmithers::new(store.clone(), vcs, registry.clone(), analyser, rewriter, 1, 0);

    // The engine has no runtime module loader: on a successful rewrite it
    // offers the new version id back through `on_rewrite` so the overlay's
    // compiled factory can be registered before the next render looks it up.
    let registry_for_hook = registry.clone();
    let observer = RalphObserver {
        supersmithers: super_smithers,
        module_hash: module_hash.clone(),
        baseline_source: baseline_source.to_string(),
        triggers: Triggers {
            stalls: true,
            ..Default::default()
        },
        on_rewrite: Some(Arc::new(move |version_id| {
            registry_for_hook.register(version_id.to_string(), |_| component::stop("rewrite installed a stop"));
        })),
    };

    let executor = Arc::new(StubAgentExecutor::fixed("ok"));
    let mut ralph = RalphLoop::new(
        store.clone(),
        executor,
        execution_id,
        RalphConfig {
            max_iterations: 10,
            stall_k: 2,
            ..Default::default()
        },
        CancellationToken::new(),
    )
    .with_observer(observer);

    let render = move |_n: u32| component::super_smithers(&ctx, &registry, module_path, baseline_source, task("baseline placeholder"));

    let reason = ralph.run(0, render, &mut phases).await.unwrap();
    assert_eq!(reason, StopReason::Stop("rewrite installed a stop".to_string()));

    let active = store
        .query_one("SELECT version_id FROM active_overrides WHERE module_hash = ?1", &[module_hash.as_str().into()])
        .unwrap()
        .unwrap();
    let version_id = active.get_text("version_id").unwrap().to_string();

    let versions = store.query("SELECT version_id FROM module_versions WHERE module_hash = ?1", &[module_hash.as_str().into()]).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].get_text("version_id"), Some(version_id.as_str()));
}

#[tokio::test]
async fn s5_bounded_iterations_stops_at_max_iterations_reached() {
    let execution_id = "exec-s5";
    let store = seeded_store(execution_id);
    let ctx = ctx_for(store.clone(), execution_id);

    let mut plan = Plan::new(3);
    for i in 0..8 {
        plan = plan.phase(Phase::new(format!("p{i}")));
    }
    let mut phases = PhaseRegistry::load_or_init(store.clone(), execution_id, &plan.declared_phases()).unwrap();
    plan.register_hooks(&mut phases);

    let executor = Arc::new(StubAgentExecutor::fixed("ok"));
    let mut ralph = RalphLoop::new(
        store.clone(),
        executor,
        execution_id,
        RalphConfig {
            max_iterations: 3,
            stall_k: 10_000,
            ..Default::default()
        },
        CancellationToken::new(),
    );

    let reason = ralph.run(0, |_n| plan.render(&ctx), &mut phases).await.unwrap();
    assert_eq!(reason, StopReason::MaxIterationsReached);

    let frames = store
        .query("SELECT sequence_number FROM render_frames WHERE execution_id = ?1", &[execution_id.into()])
        .unwrap();
    assert_eq!(frames.len(), 3);
}

#[tokio::test]
async fn s6_invalid_overlay_leaves_baseline_active_and_persists_no_module_version() {
    let execution_id = "exec-s6";
    let store = seeded_store(execution_id);
    let ctx = ctx_for(store.clone(), execution_id);
    let registry = Arc::new(OverlayRegistry::new());

    let dir = tempfile::tempdir().unwrap();
    let vcs = OverlayVcs::open_or_init(dir.path()).unwrap();
    let analyser = Arc::new(StubAnalyser { recommended: true });
    let rewriter = Arc::new(StubRewriter {
        new_code: "// module_hash: whatever\nfn overlay_factory() { let _ = \"./y\"; }\n".to_string(),
    });
    let mut super_smithers = SuperSmithers::new(store.clone(), vcs, registry.clone(), analyser, rewriter, 1, 0);

    let module_path = "/workflow.rs";
    let baseline_source = "baseline source";
    let module_hash = component::module_hash(module_path, baseline_source);

    let outcome = super_smithers
        .maybe_rewrite(
            true,
            RewriteContext {
                module_hash: module_hash.clone(),
                stall_count: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, RewriteOutcome::ValidationFailed { attempts: 2 });

    let module_versions = store.query("SELECT version_id FROM module_versions", &[]).unwrap();
    assert!(module_versions.is_empty(), "no ModuleVersion should persist when every attempt fails validation");

    let node = component::super_smithers(&ctx, &registry, module_path, baseline_source, task("baseline"));
    match &node.children[0].kind {
        NodeKind::Task { label } => assert_eq!(label, "baseline"),
        _ => panic!("baseline must remain active when no override was ever installed"),
    }
}

fn smithers_bin() -> Command {
    Command::cargo_bin("smithers").unwrap()
}

#[test]
fn cli_help_lists_run_status_and_resume() {
    smithers_bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run").and(predicate::str::contains("status")).and(predicate::str::contains("resume")));
}

#[test]
fn cli_status_on_an_empty_workspace_reports_no_executions_without_erroring() {
    let dir = TempDir::new().unwrap();
    smithers_bin()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("no executions"));
}
