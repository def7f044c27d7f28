//! Overlay repository: a VCS-tracked directory holding every rewritten module
//! version. Open-or-init a `git2::Repository`, stage everything, commit with
//! `Signature::now`, handle the unborn-branch case.
//!
//! `jj` support is a documented follow-on backend (see DESIGN.md); this
//! implementation targets `git2` only.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fs2::FileExt;
use git2::{Repository, Signature};

/// Advisory lock over the overlay repository's `.lock` file, serialising
/// concurrent writers with a 30-second timeout.
pub struct OverlayLock {
    _file: fs::File,
}

impl OverlayLock {
    pub fn acquire(repo_path: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = repo_path.join(".lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open lock file at {}", lock_path.display()))?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { _file: file }),
                Err(_) if start.elapsed() < timeout => {
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "timed out after {:?} acquiring overlay lock: {e}",
                        timeout
                    ))
                }
            }
        }
    }
}

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin wrapper over a `git2::Repository` rooted at the overlay directory.
/// Overlay files live at `modules/<module_hash>/<version_id>.rs`.
pub struct OverlayVcs {
    repo: Repository,
    root: PathBuf,
}

impl OverlayVcs {
    pub fn open_or_init(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("failed to create overlay root {}", root.display()))?;
        let repo = match Repository::open(root) {
            Ok(r) => r,
            Err(_) => Repository::init(root).context("failed to init overlay repository")?,
        };
        Ok(Self { repo, root: root.to_path_buf() })
    }

    fn module_path(&self, module_hash: &str, version_id: &str) -> PathBuf {
        self.root.join("modules").join(module_hash).join(format!("{version_id}.rs"))
    }

    /// Writes `code` to its module path; returns the path relative to the
    /// repository root.
    pub fn write_overlay_file(&self, module_hash: &str, version_id: &str, code: &str) -> Result<PathBuf> {
        let path = self.module_path(module_hash, version_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, code).with_context(|| format!("failed to write overlay file at {}", path.display()))?;
        Ok(path.strip_prefix(&self.root)?.to_path_buf())
    }

    /// Stages everything and commits. Message includes scope and trigger (spec
    /// §4.6 step 5). Returns the new commit id.
    pub fn commit(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("smithers", "smithers@localhost")?;

        let commit_id = if let Some(parent) = self.head_commit() {
            self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
        } else {
            self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?
        };
        Ok(commit_id.to_string())
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo.head().ok().and_then(|h| h.peel_to_commit().ok())
    }

    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (OverlayVcs, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let vcs = OverlayVcs::open_or_init(dir.path()).unwrap();
        let mut config = git2::Repository::open(dir.path()).unwrap().config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        (vcs, dir)
    }

    #[test]
    fn write_then_commit_produces_sha() {
        let (vcs, _dir) = setup();
        assert!(vcs.head_sha().is_none());
        vcs.write_overlay_file("hash-a", "v1", "fn overlay_factory() {}").unwrap();
        let sha = vcs.commit("[smithers] rewrite scope=a trigger=stall").unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(vcs.head_sha(), Some(sha));
    }

    #[test]
    fn overlay_file_lands_under_module_hash_directory() {
        let (vcs, _dir) = setup();
        let rel = vcs.write_overlay_file("hash-b", "v2", "// code").unwrap();
        assert!(rel.starts_with("modules/hash-b") || rel.to_string_lossy().contains("hash-b"));
    }

    #[test]
    fn lock_blocks_a_second_immediate_attempt() {
        let dir = tempdir().unwrap();
        let _held = OverlayLock::acquire(dir.path(), Duration::from_millis(50)).unwrap();
        let second = OverlayLock::acquire(dir.path(), Duration::from_millis(50));
        assert!(second.is_err());
    }
}
