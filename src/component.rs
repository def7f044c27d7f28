//! Author-facing builder API — the contract a workflow script programs
//! against.
//!
//! A workflow is authored as a tree of builders chained fluently
//! (`Phase::new(...).with_children(...)`) rather than interpreted from a
//! markup-like component tree at runtime. `Node`/`NodeKind` (the pure data
//! the reconciler walks) live in `smithers_runtime::reconciler`; everything
//! here produces one.
//!
//! `Phase` is the one builder that needs a `Ctx` at render time (to evaluate
//! `skip_if`) and carries lifecycle hooks the rendered `Node` itself cannot
//! hold without breaking its `PartialEq`/`Clone` purity — those are collected
//! separately via `Plan::register_hooks` and fed to `PhaseRegistry`, keeping
//! rendering pure while mount callbacks stay the only place side effects fire.

use std::sync::Arc;

use smithers_runtime::phase_registry::PhaseRegistry;
use smithers_runtime::reconciler::{Node, NodeKind};
use smithers_runtime::store::Store;
use smithers_runtime::supersmithers::validator::sha256_hex;
use smithers_runtime::supersmithers::OverlayRegistry;

use crate::hooks::Ctx;

type SkipPredicate = Arc<dyn Fn(&Ctx) -> bool + Send + Sync>;
type Hook = Arc<dyn Fn() + Send + Sync>;

/// A named phase with an optional `skip_if` predicate and `on_start`/
/// `on_complete` lifecycle hooks.
pub struct Phase {
    id: String,
    name: String,
    skip_if: Option<SkipPredicate>,
    on_start: Option<Hook>,
    on_complete: Option<Hook>,
    children: Vec<Node>,
}

impl Phase {
    /// `name` also becomes the Phase's durable id; use `with_id` if two
    /// phases in the same plan would otherwise collide.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            skip_if: None,
            on_start: None,
            on_complete: None,
            children: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.children = children;
        self
    }

    pub fn skip_if(mut self, f: impl Fn(&Ctx) -> bool + Send + Sync + 'static) -> Self {
        self.skip_if = Some(Arc::new(f));
        self
    }

    pub fn on_start(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Only the active Phase renders its children; any other status renders a
    /// structural placeholder so the tree XML always shows the full plan
    /// (durable status is read straight from the `phases` row PhaseRegistry
    /// maintains, since render happens before this iteration's advancement).
    fn render(&self, ctx: &Ctx) -> Node {
        let skip = self.skip_if.as_ref().map(|f| f(ctx)).unwrap_or(false);
        let is_active = ctx
            .store()
            .query_one("SELECT status FROM phases WHERE id = ?1", &[self.id.as_str().into()])
            .ok()
            .flatten()
            .and_then(|row| row.get_text("status").map(str::to_string))
            .is_some_and(|status| status == "active");
        let children = if is_active { self.children.clone() } else { Vec::new() };
        Node::new(NodeKind::Phase {
            name: self.name.clone(),
            skip,
        })
        .with_key(self.id.clone())
        .with_children(children)
    }

    fn register_hooks_into(&self, registry: &mut PhaseRegistry) {
        registry.register_hooks(self.id.clone(), self.on_start.clone(), self.on_complete.clone());
    }
}

/// A child of a Phase with the same lifecycle shape, without phase-layer
/// advancement semantics.
pub fn step(name: impl Into<String>, children: Vec<Node>) -> Node {
    Node::new(NodeKind::Step { name: name.into() }).with_children(children)
}

/// Marks direct children as concurrently eligible.
pub fn parallel(children: Vec<Node>) -> Node {
    Node::new(NodeKind::Parallel).with_children(children)
}

/// A leaf that invokes the external agent executor once per mount. Identity
/// is the durable `AgentRun.id` computed by the reconciler, not anything
/// carried here.
pub struct Agent {
    prompt: String,
    model: String,
    allowed_tools: Vec<String>,
    key: Option<String>,
}

impl Agent {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            allowed_tools: Vec::new(),
            key: None,
        }
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn build(self) -> Node {
        let mut node = Node::new(NodeKind::Agent {
            prompt: self.prompt,
            model: self.model,
            allowed_tools: self.allowed_tools,
        });
        if let Some(key) = self.key {
            node = node.with_key(key);
        }
        node
    }
}

/// Provider-specific `Agent` subclass. Defaults the model name; everything
/// else is identical to a generic `Agent`.
pub struct Claude {
    inner: Agent,
}

impl Claude {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            inner: Agent::new(prompt, "claude-sonnet"),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.inner.model = model.into();
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.inner = self.inner.with_allowed_tools(tools);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.inner = self.inner.with_key(key);
        self
    }

    pub fn build(self) -> Node {
        self.inner.build()
    }
}

/// Renders `children` iff `predicate(ctx)` is true.
pub fn if_(ctx: &Ctx, predicate: impl Fn(&Ctx) -> bool, children: Vec<Node>) -> Node {
    let active = predicate(ctx);
    let node = Node::new(NodeKind::Conditional { active });
    if active {
        node.with_children(children)
    } else {
        node
    }
}

/// A terminal node: when mounted, the RalphLoop finishes with `reason`.
pub fn stop(reason: impl Into<String>) -> Node {
    Node::new(NodeKind::Stop { reason: reason.into() })
}

/// Presentational leaf with no execution semantics.
pub fn task(label: impl Into<String>) -> Node {
    Node::new(NodeKind::Task { label: label.into() })
}

/// Wraps `baseline` as a branded plan eligible for SuperSmithers rewriting.
/// `module_path` and `baseline_source` are hashed together into the
/// `module_hash` that scopes cooldowns, caps, and `ActiveOverride` lookups.
///
/// Each render checks `active_overrides` for this `module_hash`: if a rewrite
/// has been activated, `registry` resolves the overlay's factory and its
/// output replaces `baseline` for this and every following iteration as one
/// atomic subtree swap. A failed lookup is an `OverlayLoadError`: the
/// override row is cleared and rendering falls back to `baseline` rather
/// than leaving the Execution stuck.
pub fn super_smithers(ctx: &Ctx, registry: &OverlayRegistry, module_path: &str, baseline_source: &str, baseline: Node) -> Node {
    let module_hash = module_hash(module_path, baseline_source);
    let active_version_id = ctx
        .store()
        .query_one(
            "SELECT version_id FROM active_overrides WHERE module_hash = ?1",
            &[module_hash.as_str().into()],
        )
        .ok()
        .flatten()
        .and_then(|row| row.get_text("version_id").map(str::to_string));

    let child = match active_version_id {
        None => baseline,
        Some(version_id) => match registry.resolve(&module_hash, &version_id) {
            Ok(overlay) => overlay,
            Err(err) => {
                tracing::warn!(
                    module_hash = %module_hash,
                    version_id = %version_id,
                    error = %err,
                    "overlay load failed, reverting to baseline"
                );
                let _ = ctx.store().run(
                    "DELETE FROM active_overrides WHERE module_hash = ?1",
                    &[module_hash.as_str().into()],
                );
                baseline
            }
        },
    };

    Node::new(NodeKind::SuperSmithers { module_hash }).with_children(vec![child])
}

/// Stable identifier of a plan module, derived from its absolute path and
/// baseline content.
pub fn module_hash(module_path: &str, baseline_source: &str) -> String {
    sha256_hex(&format!("{module_path}\n{baseline_source}"))
}

/// Top-level iteration controller plus the declared set of Phases: a
/// builder that accumulates `Phase`s and renders the whole tree against a
/// `Ctx` each iteration.
pub struct Plan {
    max_iterations: u32,
    global_timeout_ms: Option<u64>,
    snapshot_before_start: bool,
    phases: Vec<Phase>,
}

impl Plan {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            global_timeout_ms: None,
            snapshot_before_start: false,
            phases: Vec::new(),
        }
    }

    pub fn global_timeout_ms(mut self, ms: u64) -> Self {
        self.global_timeout_ms = Some(ms);
        self
    }

    pub fn snapshot_before_start(mut self) -> Self {
        self.snapshot_before_start = true;
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn global_timeout_ms_value(&self) -> Option<u64> {
        self.global_timeout_ms
    }

    pub fn snapshot_requested(&self) -> bool {
        self.snapshot_before_start
    }

    /// `(id, name)` pairs in declaration order, for `PhaseRegistry::load_or_init`.
    pub fn declared_phases(&self) -> Vec<(String, String)> {
        self.phases.iter().map(|p| (p.id.clone(), p.name.clone())).collect()
    }

    /// Registers every Phase's `on_start`/`on_complete` hooks once, before the
    /// loop starts: hooks fire on transition, not on render.
    pub fn register_hooks(&self, registry: &mut PhaseRegistry) {
        for phase in &self.phases {
            phase.register_hooks_into(registry);
        }
    }

    /// Renders the whole tree for one iteration. Pure with respect to `ctx`
    /// reads: the only effectful step is evaluating each Phase's `skip_if`.
    pub fn render(&self, ctx: &Ctx) -> Node {
        let children = self.phases.iter().map(|p| p.render(ctx)).collect();
        Node::new(NodeKind::RalphLoop {
            max_iterations: self.max_iterations,
            global_timeout_ms: self.global_timeout_ms,
            snapshot_before_start: self.snapshot_before_start,
        })
        .with_children(children)
    }
}
