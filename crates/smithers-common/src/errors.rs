//! Typed error hierarchy for Smithers.
//!
//! One enum per subsystem, each `thiserror`-derived, unified at the driver boundary
//! by `SmithersError`. Only `UsageError` and fatal `StoreError` subkinds terminate the
//! driver; everything else is recorded on the owning row and surfaced without
//! unwinding the iteration.

use thiserror::Error;

/// A malformed workflow, detected before the first iteration runs.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("workflow is not wrapped in a RalphLoop or SuperSmithers root")]
    UnbrandedPlan,

    #[error("maxIterations must be set and greater than zero")]
    MissingMaxIterations,

    #[error("cyclic phase dependency: {0}")]
    CyclicPhase(String),

    #[error("phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Subkind of a `StoreError`, used to decide the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Migration or DDL mismatch. Fatal.
    Schema,
    /// Constraint violation (unique, foreign key). Fatal.
    Constraint,
    /// Transient I/O failure. Retried once.
    Io,
    /// Store was closed under the caller. Fatal.
    Closed,
    /// On-disk data failed a consistency check on open. Fatal.
    Corrupt,
}

impl StoreErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Io)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Constraint => "constraint",
            Self::Io => "io",
            Self::Closed => "closed",
            Self::Corrupt => "corrupt",
        }
    }
}

/// The Store failed to execute a read or write.
#[derive(Debug, Error)]
#[error("store error ({kind}): {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl std::fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: StoreErrorKind, message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// A render function threw while reconciling a node.
#[derive(Debug, Error)]
#[error("reconcile error on node {node_id}: {message}")]
pub struct ReconcileError {
    pub node_id: String,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl ReconcileError {
    pub fn new(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            message: message.into(),
            source: None,
        }
    }
}

/// The external AgentExecutor surfaced a failure for a given AgentRun.
#[derive(Debug, Error)]
#[error("agent run {agent_run_id} failed: {message}")]
pub struct AgentError {
    pub agent_run_id: String,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl AgentError {
    pub fn new(agent_run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_run_id: agent_run_id.into(),
            message: message.into(),
            source: None,
        }
    }
}

/// A ToolCall failed. Visible to the owning AgentRun.
#[derive(Debug, Error)]
#[error("tool call {tool_call_id} ({tool_name}) failed: {message}")]
pub struct ToolError {
    pub tool_call_id: String,
    pub tool_name: String,
    pub message: String,
}

/// A stable identifier for a `RewriteValidationError` rule, so S6-style tests can
/// assert on which constraint tripped without string-matching the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRule {
    /// Overlay code references a relative, non-registered factory path.
    NoRelativeImports,
    /// Overlay code references an identifier outside the allowed overlay API surface.
    NoForeignGlobals,
    /// Overlay does not register at least one `Node` factory.
    MustRegisterFactory,
    /// Overlay factory closure captures non-`Send` state.
    MustBeSend,
    /// Overlay code exceeds the configured size ceiling.
    SizeCeiling,
    /// `module_hash` does not match the scope being rewritten.
    HashMismatch,
}

impl ValidationRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoRelativeImports => "no-relative-imports",
            Self::NoForeignGlobals => "no-foreign-globals",
            Self::MustRegisterFactory => "must-register-factory",
            Self::MustBeSend => "must-be-send",
            Self::SizeCeiling => "size-ceiling",
            Self::HashMismatch => "hash-mismatch",
        }
    }
}

impl std::fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SuperSmithers' validator rejected a rewrite proposal.
#[derive(Debug, Error)]
#[error("rewrite rejected by rule {rule}: {message}")]
pub struct RewriteValidationError {
    pub rule: ValidationRule,
    pub message: String,
}

impl RewriteValidationError {
    pub fn new(rule: ValidationRule, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
        }
    }
}

/// The `OverlayRegistry` factory lookup failed for a `version_id`.
#[derive(Debug, Error)]
#[error("overlay load failed for version {version_id}: {message}")]
pub struct OverlayLoadError {
    pub version_id: String,
    pub message: String,
}

/// External cancellation. Resume is legal after this.
#[derive(Debug, Error)]
#[error("execution {execution_id} was interrupted")]
pub struct Interrupted {
    pub execution_id: String,
}

/// Crate-wide error, unifying every subsystem at the driver boundary.
#[derive(Debug, Error)]
pub enum SmithersError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    RewriteValidation(#[from] RewriteValidationError),

    #[error(transparent)]
    OverlayLoad(#[from] OverlayLoadError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SmithersError {
    /// Whether this error should terminate the driver outright: only
    /// UsageError and fatal StoreError subkinds are fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Usage(_) => true,
            Self::Store(e) => !e.is_retryable(),
            Self::Other(_) => true,
            _ => false,
        }
    }
}
