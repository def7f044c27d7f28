//! Interprets the author's declarative tree as nodes with durable identity and
//! execution state.
//!
//! `Node`/`NodeKind` are plain data: `render()` is pure with respect to Store
//! reads and props, so a render pass simply re-evaluates the author's builder
//! tree into a fresh `Node` value each iteration. Side effects — scheduling an
//! `AgentRun`, firing a Phase's `on_start`/`on_complete` — are the caller's job,
//! driven off the mount/unmount events `Reconciler::reconcile` returns. Phase
//! lifecycle hooks live on `PhaseRegistry`, not here, since firing them is a
//! phase-advancement concern, not a generic tree-diffing one.

use std::collections::HashMap;

/// Exhaustive node-kind tag. Each kind carries only the props a render pass
/// can evaluate without side effects.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Root,
    RalphLoop {
        max_iterations: u32,
        global_timeout_ms: Option<u64>,
        snapshot_before_start: bool,
    },
    Phase {
        name: String,
        /// Result of evaluating the phase's `skipIf` predicate this render.
        skip: bool,
    },
    Step {
        name: String,
    },
    Parallel,
    Agent {
        prompt: String,
        model: String,
        allowed_tools: Vec<String>,
    },
    Conditional {
        active: bool,
    },
    Stop {
        reason: String,
    },
    SuperSmithers {
        module_hash: String,
    },
    Task {
        label: String,
    },
}

impl NodeKind {
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Root => "Root",
            NodeKind::RalphLoop { .. } => "RalphLoop",
            NodeKind::Phase { .. } => "Phase",
            NodeKind::Step { .. } => "Step",
            NodeKind::Parallel => "Parallel",
            NodeKind::Agent { .. } => "Agent",
            NodeKind::Conditional { .. } => "Conditional",
            NodeKind::Stop { .. } => "Stop",
            NodeKind::SuperSmithers { .. } => "SuperSmithers",
            NodeKind::Task { .. } => "Task",
        }
    }
}

/// One node in the author's declarative tree, as produced by a single render
/// pass. Identity is recomputed from structural position, not object identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub key: Option<String>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            key: None,
            children: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.children = children;
        self
    }
}

/// Durable node identity: `(parent, position, kind, key)`. Stable across
/// re-renders so durable rows (Phase, AgentRun) bind correctly to a remounted
/// subtree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub(crate) fn compute(parent: Option<&NodeId>, position: usize, kind_tag: &str, key: Option<&str>) -> Self {
        let mut s = String::new();
        if let Some(p) = parent {
            s.push_str(&p.0);
            s.push('/');
        }
        s.push_str(kind_tag);
        s.push('#');
        s.push_str(&position.to_string());
        if let Some(k) = key {
            s.push(':');
            s.push_str(k);
        }
        NodeId(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Running,
    Complete,
    Error(String),
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Complete | NodeState::Error(_))
    }

    fn tag(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Complete => "complete",
            NodeState::Error(_) => "error",
        }
    }
}

struct Mounted {
    kind_tag: &'static str,
    state: NodeState,
    scope_rev: i64,
}

/// Events produced by one `reconcile` call. The caller (RalphLoop driver) acts
/// on these: schedule work for newly mounted `Agent` nodes, cancel in-flight
/// work (mark Store rows `cancelled`) for unmounted ones.
#[derive(Debug, Default)]
pub struct MountEvents {
    pub mounted: Vec<NodeId>,
    pub unmounted: Vec<NodeId>,
}

/// Owns the previous render's mounted-node set and diffs it against each new
/// tree. One `Reconciler` per Execution.
#[derive(Default)]
pub struct Reconciler {
    mounted: HashMap<NodeId, Mounted>,
    scope_rev: i64,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope_rev(&self) -> i64 {
        self.scope_rev
    }

    /// Bumps the scope revision (an overlay swap), which forces every node in
    /// the next `reconcile` call to be treated as freshly mounted even if its
    /// identity is unchanged.
    pub fn bump_scope_rev(&mut self) {
        self.scope_rev += 1;
        self.mounted.clear();
    }

    pub fn node_state(&self, id: &NodeId) -> Option<&NodeState> {
        self.mounted.get(id).map(|m| &m.state)
    }

    pub fn set_node_state(&mut self, id: &NodeId, state: NodeState) {
        if let Some(m) = self.mounted.get_mut(id) {
            m.state = state;
        }
    }

    /// Walks `tree`, computing identities and diffing against the previous
    /// mount set. Newly-reachable ids are recorded as `pending` and reported as
    /// mounted; ids no longer reachable are reported as unmounted and dropped.
    pub fn reconcile(&mut self, tree: &Node) -> MountEvents {
        let mut next = HashMap::new();
        let mut events = MountEvents::default();
        self.walk(tree, None, 0, &mut next, &mut events);

        for (id, _) in self.mounted.drain() {
            if !next.contains_key(&id) {
                events.unmounted.push(id);
            }
        }
        self.mounted = next;
        events
    }

    fn walk(
        &mut self,
        node: &Node,
        parent: Option<&NodeId>,
        position: usize,
        next: &mut HashMap<NodeId, Mounted>,
        events: &mut MountEvents,
    ) {
        let id = NodeId::compute(parent, position, node.kind.tag(), node.key.as_deref());
        let previously_mounted = self.mounted.contains_key(&id);
        if !previously_mounted {
            events.mounted.push(id.clone());
        }
        let state = self
            .mounted
            .get(&id)
            .map(|m| m.state.clone())
            .unwrap_or(NodeState::Pending);
        next.insert(
            id.clone(),
            Mounted {
                kind_tag: node.kind.tag(),
                state,
                scope_rev: self.scope_rev,
            },
        );
        for (i, child) in node.children.iter().enumerate() {
            self.walk(child, Some(&id), i, next, events);
        }
    }

    /// Canonical XML-like tree string: the stability fingerprint used for stall
    /// detection.
    pub fn render_xml(&self, tree: &Node) -> String {
        let mut out = String::new();
        Self::write_xml(tree, &mut out, 0);
        out
    }

    fn write_xml(node: &Node, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let tag = node.kind.tag();
        out.push_str(&indent);
        out.push('<');
        out.push_str(tag);
        if let Some(key) = &node.key {
            out.push_str(&format!(" key=\"{key}\""));
        }
        out.push_str(&Self::attrs(&node.kind));
        if node.children.is_empty() {
            out.push_str("/>\n");
            return;
        }
        out.push_str(">\n");
        for child in &node.children {
            Self::write_xml(child, out, depth + 1);
        }
        out.push_str(&indent);
        out.push_str("</");
        out.push_str(tag);
        out.push_str(">\n");
    }

    fn attrs(kind: &NodeKind) -> String {
        match kind {
            NodeKind::RalphLoop { max_iterations, .. } => format!(" maxIterations=\"{max_iterations}\""),
            NodeKind::Phase { name, skip } => format!(" name=\"{name}\" skip=\"{skip}\""),
            NodeKind::Step { name } => format!(" name=\"{name}\""),
            NodeKind::Agent { model, .. } => format!(" model=\"{model}\""),
            NodeKind::Conditional { active } => format!(" active=\"{active}\""),
            NodeKind::Stop { reason } => format!(" reason=\"{reason}\""),
            NodeKind::SuperSmithers { module_hash } => format!(" moduleHash=\"{module_hash}\""),
            NodeKind::Task { label } => format!(" label=\"{label}\""),
            NodeKind::Root | NodeKind::Parallel => String::new(),
        }
    }
}

/// Helper used by stall detection (§4.6): true if `frames` contains at least
/// `k` entries and the last `k` are byte-identical.
pub fn is_stalled(frames: &[String], k: usize) -> bool {
    if k == 0 || frames.len() < k {
        return false;
    }
    let tail = &frames[frames.len() - k..];
    tail.windows(2).all(|w| w[0] == w[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(prompt: &str) -> Node {
        Node::new(NodeKind::Agent {
            prompt: prompt.to_string(),
            model: "stub".to_string(),
            allowed_tools: vec![],
        })
    }

    fn phase(name: &str, skip: bool, children: Vec<Node>) -> Node {
        Node::new(NodeKind::Phase {
            name: name.to_string(),
            skip,
        })
        .with_children(children)
    }

    #[test]
    fn identity_stable_across_identical_rerenders() {
        let mut r = Reconciler::new();
        let tree = Node::new(NodeKind::Root).with_children(vec![
            phase("A", false, vec![agent("say hi")]),
            phase("B", false, vec![agent("say bye")]),
        ]);

        let first = r.reconcile(&tree);
        assert_eq!(first.mounted.len(), 5); // root + 2 phases + 2 agents
        assert!(first.unmounted.is_empty());

        let second = r.reconcile(&tree);
        assert!(second.mounted.is_empty(), "identical tree must not remount anything");
        assert!(second.unmounted.is_empty());
    }

    #[test]
    fn removed_subtree_is_unmounted() {
        let mut r = Reconciler::new();
        let with_b = Node::new(NodeKind::Root).with_children(vec![
            phase("A", false, vec![agent("say hi")]),
            phase("B", false, vec![agent("say bye")]),
        ]);
        r.reconcile(&with_b);

        let without_b =
            Node::new(NodeKind::Root).with_children(vec![phase("A", false, vec![agent("say hi")])]);
        let events = r.reconcile(&without_b);
        assert_eq!(events.unmounted.len(), 2); // phase B + its agent
        assert!(events.mounted.is_empty());
    }

    #[test]
    fn scope_rev_bump_remounts_everything() {
        let mut r = Reconciler::new();
        let tree = Node::new(NodeKind::Root).with_children(vec![phase("A", false, vec![agent("hi")])]);
        r.reconcile(&tree);
        r.bump_scope_rev();
        let events = r.reconcile(&tree);
        assert_eq!(events.mounted.len(), 3);
    }

    #[test]
    fn xml_roundtrip_reflects_structure() {
        let r = Reconciler::new();
        let tree = Node::new(NodeKind::Root).with_children(vec![phase("A", false, vec![agent("hi")])]);
        let xml = r.render_xml(&tree);
        assert!(xml.contains("<Root>"));
        assert!(xml.contains("name=\"A\""));
        assert!(xml.contains("<Agent"));
    }

    #[test]
    fn stall_detection_requires_k_identical_frames() {
        let frames = vec!["a".to_string(), "a".to_string(), "a".to_string()];
        assert!(is_stalled(&frames, 3));
        assert!(!is_stalled(&frames, 4));
        let changing = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert!(!is_stalled(&changing, 3));
    }
}
