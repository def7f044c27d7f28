//! Self-rewriting observer: analyses a running plan subtree and, when
//! warranted, installs a rewritten version without losing durable state.

pub mod overlay;
pub mod validator;
pub mod vcs;

pub use overlay::{OverlayContext, OverlayRegistry};
pub use vcs::{OverlayLock, OverlayVcs, DEFAULT_LOCK_TIMEOUT};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smithers_common::errors::{RewriteValidationError, StoreError, StoreErrorKind};
use tracing::Instrument;

use crate::store::Store;

/// Enumerated rewrite triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Triggers {
    pub error_rate_threshold: Option<f64>,
    pub stalls: bool,
    pub token_ceiling: Option<i64>,
}

/// Everything the analyser/rewriter need: metrics, recent history, the tree
/// and the baseline source of the target module.
#[derive(Debug, Clone, Default)]
pub struct RewriteContext {
    pub module_hash: String,
    pub tokens: i64,
    pub agent_count: i64,
    pub error_count: i64,
    pub stall_count: i64,
    pub last_errors: Vec<String>,
    pub last_frames: Vec<String>,
    pub tree_xml: String,
    pub baseline_source: String,
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub summary: String,
    pub issues: Vec<String>,
    pub recommended: bool,
    pub goals: Vec<String>,
    pub risk: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct RewriteProposal {
    pub summary: String,
    pub rationale: String,
    pub risk: String,
    pub new_code: String,
}

/// Pluggable like `AgentExecutor`. This crate ships deterministic stubs for
/// tests and demos; an integrating binary wires a real `AgentExecutor`-backed
/// implementation.
#[async_trait]
pub trait Analyser: Send + Sync {
    async fn analyse(&self, ctx: &RewriteContext) -> AnalysisResult;
}

#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(
        &self,
        ctx: &RewriteContext,
        analysis: &AnalysisResult,
        previous_errors: &[RewriteValidationError],
    ) -> RewriteProposal;
}

/// Always recommends a rewrite with the supplied goals; the stall-driven
/// rewrite scenario is built against this.
pub struct StubAnalyser {
    pub recommended: bool,
}

#[async_trait]
impl Analyser for StubAnalyser {
    async fn analyse(&self, ctx: &RewriteContext) -> AnalysisResult {
        AnalysisResult {
            summary: format!("{} stalls observed", ctx.stall_count),
            issues: vec![],
            recommended: self.recommended,
            goals: vec!["break the stall".to_string()],
            risk: "low".to_string(),
            confidence: if self.recommended { 0.9 } else { 0.1 },
        }
    }
}

/// Returns a fixed `new_code`, ignoring context. Used directly for a valid
/// overlay and for an overlay with a relative import.
pub struct StubRewriter {
    pub new_code: String,
}

#[async_trait]
impl Rewriter for StubRewriter {
    async fn rewrite(
        &self,
        _ctx: &RewriteContext,
        _analysis: &AnalysisResult,
        _previous_errors: &[RewriteValidationError],
    ) -> RewriteProposal {
        RewriteProposal {
            summary: "stub rewrite".to_string(),
            rationale: "deterministic test fixture".to_string(),
            risk: "low".to_string(),
            new_code: self.new_code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    NotTriggered,
    NotRecommended,
    Rewrote { version_id: String },
    ValidationFailed { attempts: u32 },
}

/// Cooldown/cap bookkeeping plus the rewrite pipeline.
/// One instance per Execution; `module_hash` scopes every cap independently.
pub struct SuperSmithers {
    store: Arc<dyn Store>,
    vcs: OverlayVcs,
    registry: Arc<OverlayRegistry>,
    analyser: Arc<dyn Analyser>,
    rewriter: Arc<dyn Rewriter>,
    max_rewrites_per_module: u32,
    rewrite_cooldown_ms: i64,
    max_attempts: u32,
    size_ceiling_bytes: usize,
    rewrites_done: HashMap<String, u32>,
    last_rewrite_at: HashMap<String, DateTime<Utc>>,
    in_flight: HashSet<String>,
}

impl SuperSmithers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        vcs: OverlayVcs,
        registry: Arc<OverlayRegistry>,
        analyser: Arc<dyn Analyser>,
        rewriter: Arc<dyn Rewriter>,
        max_rewrites_per_module: u32,
        rewrite_cooldown_ms: i64,
    ) -> Self {
        Self {
            store,
            vcs,
            registry,
            analyser,
            rewriter,
            max_rewrites_per_module,
            rewrite_cooldown_ms,
            max_attempts: validator::DEFAULT_MAX_ATTEMPTS,
            size_ceiling_bytes: validator::DEFAULT_SIZE_CEILING_BYTES,
            rewrites_done: HashMap::new(),
            last_rewrite_at: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    fn eligible(&self, module_hash: &str) -> bool {
        if self.in_flight.contains(module_hash) {
            return false;
        }
        if self.rewrites_done.get(module_hash).copied().unwrap_or(0) >= self.max_rewrites_per_module {
            return false;
        }
        if let Some(last) = self.last_rewrite_at.get(module_hash) {
            let elapsed = (Utc::now() - *last).num_milliseconds();
            if elapsed < self.rewrite_cooldown_ms {
                return false;
            }
        }
        true
    }

    /// Runs the full pipeline for `module_hash` if `triggered` is true and the
    /// module is eligible (cooldown/cap checks). Persists a `ModuleVersion` and
    /// sets `ActiveOverride` on success; on repeated validation failure the
    /// scope is left on baseline and the caller should surface the error via
    /// its own `on_error` hook.
    pub async fn maybe_rewrite(
        &mut self,
        triggered: bool,
        ctx: RewriteContext,
    ) -> Result<RewriteOutcome, StoreError> {
        if !triggered || !self.eligible(&ctx.module_hash) {
            return Ok(RewriteOutcome::NotTriggered);
        }
        self.in_flight.insert(ctx.module_hash.clone());
        let span = tracing::info_span!("supersmithers_rewrite", module_hash = %ctx.module_hash);
        self.run_pipeline(ctx).instrument(span).await
    }

    async fn run_pipeline(&mut self, ctx: RewriteContext) -> Result<RewriteOutcome, StoreError> {
        let module_hash = ctx.module_hash.clone();
        tracing::info!(stall_count = ctx.stall_count, error_count = ctx.error_count, "rewrite triggered");

        let analysis = self.analyser.analyse(&ctx).await;
        if !analysis.recommended {
            tracing::info!("analyser did not recommend a rewrite");
            self.in_flight.remove(&module_hash);
            return Ok(RewriteOutcome::NotRecommended);
        }

        let mut previous_errors = Vec::new();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let proposal = self.rewriter.rewrite(&ctx, &analysis, &previous_errors).await;
            match validator::validate(&proposal.new_code, &module_hash, self.size_ceiling_bytes) {
                Ok(()) => {
                    let version_id = uuid::Uuid::new_v4().to_string();
                    let result = self.activate(&module_hash, &version_id, &proposal, &analysis);
                    self.in_flight.remove(&module_hash);
                    tracing::info!(version_id = %version_id, attempts, "rewrite activated");
                    return result.map(|()| {
                        self.rewrites_done
                            .entry(module_hash.clone())
                            .and_modify(|n| *n += 1)
                            .or_insert(1);
                        self.last_rewrite_at.insert(module_hash.clone(), Utc::now());
                        RewriteOutcome::Rewrote { version_id }
                    });
                }
                Err(validation_err) => {
                    tracing::warn!(attempt = attempts, error = %validation_err, "rewrite proposal failed validation");
                    previous_errors.push(validation_err);
                    if attempts >= self.max_attempts {
                        self.in_flight.remove(&module_hash);
                        tracing::warn!(attempts, "rewrite attempts exhausted, staying on baseline");
                        return Ok(RewriteOutcome::ValidationFailed { attempts });
                    }
                }
            }
        }
    }

    fn activate(
        &self,
        module_hash: &str,
        version_id: &str,
        proposal: &RewriteProposal,
        analysis: &AnalysisResult,
    ) -> Result<(), StoreError> {
        let _lock = OverlayLock::acquire(self.vcs.root(), DEFAULT_LOCK_TIMEOUT)
            .map_err(|e| StoreError::with_source(StoreErrorKind::Io, "failed to acquire overlay lock", e))?;

        self.vcs
            .write_overlay_file(module_hash, version_id, &proposal.new_code)
            .map_err(|e| StoreError::with_source(StoreErrorKind::Io, "failed to write overlay file", e))?;
        let commit_id = self
            .vcs
            .commit(&format!("[smithers] rewrite scope={module_hash} trigger=observer"))
            .map_err(|e| StoreError::with_source(StoreErrorKind::Io, "failed to commit overlay", e))?;

        let code_sha256 = validator::sha256_hex(&proposal.new_code);
        let now = Utc::now().to_rfc3339();
        let analysis_json = serde_json::json!({
            "summary": analysis.summary,
            "issues": analysis.issues,
            "goals": analysis.goals,
            "risk": analysis.risk,
            "confidence": analysis.confidence,
        })
        .to_string();

        self.store.transaction(&mut |tx| {
            tx.run(
                "INSERT INTO module_versions (version_id, module_hash, code, code_sha256, trigger, analysis_json, vcs_commit_id, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                &[
                    version_id.into(),
                    module_hash.into(),
                    proposal.new_code.as_str().into(),
                    code_sha256.as_str().into(),
                    "observer".into(),
                    analysis_json.as_str().into(),
                    commit_id.as_str().into(),
                    now.as_str().into(),
                ],
            )?;
            tx.run(
                "INSERT INTO active_overrides (module_hash, version_id, created_at) VALUES (?1,?2,?3)
                 ON CONFLICT(module_hash) DO UPDATE SET version_id = excluded.version_id, created_at = excluded.created_at",
                &[module_hash.into(), version_id.into(), now.as_str().into()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Rolls back `module_hash` to baseline.
    pub fn rollback(&self, module_hash: &str) -> Result<(), StoreError> {
        self.store.run(
            "DELETE FROM active_overrides WHERE module_hash = ?1",
            &[module_hash.into()],
        )?;
        Ok(())
    }

    pub fn registry(&self) -> &Arc<OverlayRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use tempfile::tempdir;

    fn harness(new_code: String, max_rewrites: u32) -> (SuperSmithers, tempfile::TempDir) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let dir = tempdir().unwrap();
        let vcs = OverlayVcs::open_or_init(dir.path()).unwrap();
        {
            let repo = git2::Repository::open(dir.path()).unwrap();
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "test").unwrap();
            config.set_str("user.email", "test@test.com").unwrap();
        }
        let registry = Arc::new(OverlayRegistry::new());
        let analyser = Arc::new(StubAnalyser { recommended: true });
        let rewriter = Arc::new(StubRewriter { new_code });
        let ss = SuperSmithers::new(store, vcs, registry, analyser, rewriter, max_rewrites, 0);
        (ss, dir)
    }

    fn ctx() -> RewriteContext {
        RewriteContext {
            module_hash: "hash-a".to_string(),
            stall_count: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn valid_overlay_activates_and_counts_against_cap() {
        let code = "// module_hash: hash-a\nfn overlay_factory() {}\n".to_string();
        let (mut ss, _dir) = harness(code, 1);
        let outcome = ss.maybe_rewrite(true, ctx()).await.unwrap();
        assert!(matches!(outcome, RewriteOutcome::Rewrote { .. }));

        // second trigger should be rejected: cap of 1 already spent.
        let second = ss.maybe_rewrite(true, ctx()).await.unwrap();
        assert_eq!(second, RewriteOutcome::NotTriggered);
    }

    #[tokio::test]
    async fn invalid_overlay_exhausts_attempts_without_activating() {
        let code = "// module_hash: hash-a\nfn overlay_factory() { let _ = \"./y\"; }\n".to_string();
        let (mut ss, _dir) = harness(code, 5);
        let outcome = ss.maybe_rewrite(true, ctx()).await.unwrap();
        assert_eq!(outcome, RewriteOutcome::ValidationFailed { attempts: 2 });

        let rows = ss
            .store
            .query("SELECT * FROM module_versions", &[])
            .unwrap();
        assert!(rows.is_empty(), "no ModuleVersion should persist on validation failure");
    }

    #[tokio::test]
    async fn untriggered_call_is_a_no_op() {
        let (mut ss, _dir) = harness("anything".to_string(), 5);
        let outcome = ss.maybe_rewrite(false, ctx()).await.unwrap();
        assert_eq!(outcome, RewriteOutcome::NotTriggered);
    }
}
