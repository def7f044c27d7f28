//! Layered configuration: `smithers.toml` in the workspace root, overridden by
//! environment variables, overridden by explicit CLI flags. Keeps a serde'd
//! file format plus a resolved runtime struct that also owns the
//! `.smithers/` directory layout, but drops any phase-glob override system:
//! Phase budgets/permission-modes are author-code concerns, not file-level
//! policy.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// On-disk shape of `smithers.toml`. Every field is optional so an absent or
/// partial file still parses; `SmithersConfig::resolve` fills the rest in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmithersToml {
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub supersmithers: SuperSmithersSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Bound on RalphLoop iterations before `MaxIterationsReached`.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub global_timeout_ms: Option<u64>,
    /// How many trailing `RenderFrame`s to keep per Execution; older frames
    /// are pruned after each persist.
    #[serde(default)]
    pub render_frame_retention: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuperSmithersSection {
    #[serde(default)]
    pub cooldown_iterations: Option<u32>,
    #[serde(default)]
    pub max_rewrites_per_module: Option<u32>,
    #[serde(default)]
    pub max_overlay_bytes: Option<usize>,
}

impl SmithersToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).context("failed to parse smithers.toml")
    }

    pub fn load_or_default(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("smithers.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Resolved runtime configuration: the `smithers.toml` file layered with
/// `SMITHERS_*` environment overrides, plus every `.smithers/` path the
/// driver needs. One instance is built per process at startup.
#[derive(Debug, Clone)]
pub struct SmithersConfig {
    pub workspace_root: PathBuf,
    pub smithers_dir: PathBuf,
    pub max_iterations: u32,
    pub global_timeout_ms: Option<u64>,
    pub render_frame_retention: u32,
    pub cooldown_iterations: u32,
    pub max_rewrites_per_module: u32,
    pub max_overlay_bytes: usize,
}

const DEFAULT_MAX_ITERATIONS: u32 = 100;
const DEFAULT_RENDER_FRAME_RETENTION: u32 = 50;
const DEFAULT_COOLDOWN_ITERATIONS: u32 = 3;
const DEFAULT_MAX_REWRITES_PER_MODULE: u32 = 5;
const DEFAULT_MAX_OVERLAY_BYTES: usize = 64 * 1024;

impl SmithersConfig {
    /// Resolves configuration for `workspace_root`: reads `smithers.toml` if
    /// present, applies `SMITHERS_*` env overrides, then `max_iterations_cli`
    /// (a `--max-iterations` flag, if the caller passed one).
    pub fn resolve(workspace_root: PathBuf, max_iterations_cli: Option<u32>) -> Result<Self> {
        let workspace_root = workspace_root
            .canonicalize()
            .context("failed to resolve workspace root")?;
        let file = SmithersToml::load_or_default(&workspace_root)?;
        let smithers_dir = workspace_root.join(".smithers");

        let max_iterations = max_iterations_cli
            .or_else(|| env_u32("SMITHERS_MAX_ITERATIONS"))
            .or(file.execution.max_iterations)
            .unwrap_or(DEFAULT_MAX_ITERATIONS);
        let global_timeout_ms = env_u64("SMITHERS_GLOBAL_TIMEOUT_MS").or(file.execution.global_timeout_ms);
        let render_frame_retention = env_u32("SMITHERS_RENDER_FRAME_RETENTION")
            .or(file.execution.render_frame_retention)
            .unwrap_or(DEFAULT_RENDER_FRAME_RETENTION);
        let cooldown_iterations = env_u32("SMITHERS_COOLDOWN_ITERATIONS")
            .or(file.supersmithers.cooldown_iterations)
            .unwrap_or(DEFAULT_COOLDOWN_ITERATIONS);
        let max_rewrites_per_module = env_u32("SMITHERS_MAX_REWRITES_PER_MODULE")
            .or(file.supersmithers.max_rewrites_per_module)
            .unwrap_or(DEFAULT_MAX_REWRITES_PER_MODULE);
        let max_overlay_bytes = env_u32("SMITHERS_MAX_OVERLAY_BYTES")
            .map(|v| v as usize)
            .or(file.supersmithers.max_overlay_bytes)
            .unwrap_or(DEFAULT_MAX_OVERLAY_BYTES);

        Ok(Self {
            workspace_root,
            smithers_dir,
            max_iterations,
            global_timeout_ms,
            render_frame_retention,
            cooldown_iterations,
            max_rewrites_per_module,
            max_overlay_bytes,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.smithers_dir.join("smithers.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.smithers_dir.join("logs")
    }

    pub fn execution_logs_dir(&self, execution_id: &str) -> PathBuf {
        self.smithers_dir.join("executions").join(execution_id).join("logs")
    }

    pub fn overlay_vcs_dir(&self) -> PathBuf {
        self.smithers_dir.join("supersmithers").join("vcs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.smithers_dir).context("failed to create .smithers directory")?;
        std::fs::create_dir_all(self.logs_dir()).context("failed to create logs directory")?;
        std::fs::create_dir_all(self.overlay_vcs_dir()).context("failed to create supersmithers vcs directory")?;
        Ok(())
    }
}

/// A user-level override location, `~/.config/smithers/smithers.toml`,
/// consulted only when no workspace-local file exists.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("smithers").join("smithers.toml"))
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
