use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use smithers::component::{Agent, Phase, Plan};
use smithers::config::SmithersConfig;
use smithers::errors::SmithersError;
use smithers::hooks::Ctx;
use smithers::interfaces::{ExecutionLogWriter, StubAgentExecutor};
use smithers::phase_registry::PhaseRegistry;
use smithers::ralph::{RalphConfig, RalphLoop, StopReason};
use smithers::reactive::ReactiveQueries;
use smithers::store::{SqliteStore, Store};

#[derive(Parser)]
#[command(name = "smithers")]
#[command(version, about = "Durable, resumable orchestration engine for long-running agent workflows")]
struct Cli {
    /// Workspace root; defaults to the current directory.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or continue, if already running) the demo workflow.
    Run {
        /// Overrides the configured maxIterations for this run.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Print the current Phase/Execution state without driving the loop.
    Status,
    /// Resume an interrupted Execution from its last settled iteration.
    Resume,
}

/// The script path under which the demo workflow's single Execution is
/// tracked: locating or creating the Execution row for this path is how a
/// restart finds its way back to an in-progress run. A real integration
/// would pass the author's workflow file path here instead.
const DEMO_SCRIPT_PATH: &str = "demo://say-hi-say-bye";

#[tokio::main]
async fn main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    let code = match &cli.command {
        Commands::Run { max_iterations } => run(&project_dir, *max_iterations, false).await?,
        Commands::Resume => run(&project_dir, None, true).await?,
        Commands::Status => {
            status(&project_dir)?;
            0
        }
    };

    Ok(std::process::ExitCode::from(code as u8))
}

/// Builds the demo two-Phase plan: `say_hi` then `say_bye`, each a single
/// agent invocation answered synchronously by `StubAgentExecutor`.
fn build_plan(max_iterations: u32) -> Plan {
    Plan::new(max_iterations)
        .phase(Phase::new("say_hi").with_children(vec![
            Agent::new("Say hello to the user in one sentence.", "stub").build(),
        ]))
        .phase(Phase::new("say_bye").with_children(vec![
            Agent::new("Say goodbye to the user in one sentence.", "stub").build(),
        ]))
}

async fn run(project_dir: &std::path::Path, max_iterations_cli: Option<u32>, resuming: bool) -> Result<i32> {
    let config = SmithersConfig::resolve(project_dir.to_path_buf(), max_iterations_cli)?;
    config.ensure_directories()?;
    let _logging_guard = smithers::logging::init(&config.logs_dir())?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.db_path()).context("failed to open store")?);
    let execution_id = locate_or_create_execution(&store, DEMO_SCRIPT_PATH)?;
    tracing::info!(execution_id = %execution_id, resuming, "starting demo execution");

    let plan = build_plan(config.max_iterations);
    let reactive = Arc::new(ReactiveQueries::new(store.clone(), &["state_entries", "state_transitions"]));
    let ctx = Ctx::new(store.clone(), reactive, execution_id.clone());

    let mut phases = PhaseRegistry::load_or_init(store.clone(), execution_id.clone(), &plan.declared_phases())?;
    plan.register_hooks(&mut phases);

    let executor = Arc::new(StubAgentExecutor::new(|run| format!("(stub reply to: {})", run.prompt)));
    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_for_signal.cancel();
        }
    });

    let log = Arc::new(
        ExecutionLogWriter::open(&config.execution_logs_dir(&execution_id))
            .context("failed to open execution log writer")?,
    );

    let mut ralph = RalphLoop::new(
        store.clone(),
        executor,
        execution_id.clone(),
        RalphConfig {
            max_iterations: config.max_iterations,
            global_timeout_ms: config.global_timeout_ms,
            render_frame_retention: config.render_frame_retention as usize,
            ..Default::default()
        },
        cancel,
    )
    .with_log(log.clone());

    let ralph_count = if resuming { ralph.resume()? } else { 0 };

    let result = ralph
        .run(ralph_count, |_n| plan.render(&ctx), &mut phases)
        .await;
    let _ = log.finalize();

    match result {
        Ok(reason) => {
            let status = match reason {
                StopReason::Interrupted => "interrupted",
                _ => "completed",
            };
            store.run(
                "UPDATE executions SET status = ?1, ended_at = ?2 WHERE id = ?3",
                &[status.into(), chrono::Utc::now().to_rfc3339().into(), execution_id.as_str().into()],
            )?;
            print_terminal_summary(&store, &execution_id, status, &reason)?;
            Ok(exit_code_for_stop(&reason))
        }
        Err(err) => {
            tracing::error!(execution_id = %execution_id, error = %err, "execution failed");
            eprintln!("execution {execution_id} failed: {err}");
            Ok(4)
        }
    }
}

/// Prints the structured terminal summary §7 requires on every exit: phase
/// and agent-run counts by terminal status, the final Execution status, and a
/// resume hint when the Execution stopped `interrupted`.
fn print_terminal_summary(
    store: &Arc<dyn Store>,
    execution_id: &str,
    status: &str,
    reason: &StopReason,
) -> Result<()> {
    let phase_counts = store.query(
        "SELECT status, COUNT(*) as n FROM phases WHERE execution_id = ?1 GROUP BY status",
        &[execution_id.into()],
    )?;
    let run_counts = store.query(
        "SELECT status, COUNT(*) as n FROM agent_runs WHERE execution_id = ?1 GROUP BY status",
        &[execution_id.into()],
    )?;

    println!("execution {execution_id} finished: {reason:?}");
    println!("  status: {status}");
    print!("  phases:");
    for row in &phase_counts {
        print!(" {}={}", row.get_text("status").unwrap_or_default(), row.get_i64("n").unwrap_or(0));
    }
    println!();
    print!("  agent runs:");
    for row in &run_counts {
        print!(" {}={}", row.get_text("status").unwrap_or_default(), row.get_i64("n").unwrap_or(0));
    }
    println!();
    if matches!(reason, StopReason::Interrupted) {
        println!("  resume with: smithers resume");
    }
    Ok(())
}

fn exit_code_for_stop(reason: &StopReason) -> i32 {
    match reason {
        StopReason::Interrupted => 1,
        _ => 0,
    }
}

fn locate_or_create_execution(store: &Arc<dyn Store>, script_path: &str) -> Result<String> {
    let existing = store
        .query_one(
            "SELECT id FROM executions WHERE script_path = ?1 AND status = 'running' ORDER BY created_at DESC",
            &[script_path.into()],
        )
        .map_err(SmithersError::from)?;
    if let Some(row) = existing {
        return Ok(row.get_text("id").unwrap_or_default().to_string());
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    store
        .run(
            "INSERT INTO executions (id, name, script_path, status, started_at, created_at) VALUES (?1,?2,?3,'running',?4,?4)",
            &[id.as_str().into(), "demo".into(), script_path.into(), now.into()],
        )
        .map_err(SmithersError::from)?;
    Ok(id)
}

fn status(project_dir: &std::path::Path) -> Result<()> {
    let config = SmithersConfig::resolve(project_dir.to_path_buf(), None)?;
    if !config.db_path().exists() {
        println!("no executions yet (no store found at {})", config.db_path().display());
        return Ok(());
    }
    let store = SqliteStore::open(&config.db_path()).context("failed to open store")?;

    let executions = store.query(
        "SELECT id, name, status, started_at, ended_at FROM executions ORDER BY created_at DESC",
        &[],
    )?;
    if executions.is_empty() {
        println!("no executions recorded");
        return Ok(());
    }

    for row in &executions {
        let id = row.get_text("id").unwrap_or_default();
        println!(
            "execution {id} [{}] started {} ended {}",
            row.get_text("status").unwrap_or_default(),
            row.get_text("started_at").unwrap_or_default(),
            row.get_text("ended_at").unwrap_or("-"),
        );
        let phases = store.query(
            "SELECT id, status, position FROM phases WHERE execution_id = ?1 ORDER BY position ASC",
            &[id.into()],
        )?;
        for phase in &phases {
            println!(
                "  phase {} -> {}",
                phase.get_text("id").unwrap_or_default(),
                phase.get_text("status").unwrap_or_default(),
            );
        }
    }
    Ok(())
}
