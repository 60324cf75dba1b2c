//! Working-tree provisioning.
//!
//! Each live assignment gets an isolated checkout alongside the repository
//! so concurrent workers never clobber each other. `ensure` is idempotent:
//! calling it twice with identical arguments on a consistent filesystem
//! returns the same path and performs no side effects the second time.

use crate::errors::WorktreeError;
use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct WorktreeProvider {
    repo_root: PathBuf,
}

impl WorktreeProvider {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    fn open(&self) -> Result<Repository, WorktreeError> {
        Ok(Repository::open(&self.repo_root)?)
    }

    /// The branch new work branches fork from.
    pub fn default_branch(&self) -> Result<String, WorktreeError> {
        let repo = self.open()?;
        if let Ok(head) = repo.head()
            && head.is_branch()
            && let Some(name) = head.shorthand()
        {
            return Ok(name.to_string());
        }
        for candidate in ["main", "master"] {
            if repo.find_branch(candidate, BranchType::Local).is_ok() {
                return Ok(candidate.to_string());
            }
        }
        Err(WorktreeError::Git(git2::Error::from_str(
            "repository has no default branch",
        )))
    }

    pub fn branch_exists(&self, name: &str) -> Result<bool, WorktreeError> {
        let repo = self.open()?;
        Ok(repo.find_branch(name, BranchType::Local).is_ok())
    }

    /// Whether every commit of `branch` is reachable from `target`, i.e.
    /// the branch has been merged. A missing branch reads as not merged.
    pub fn branch_merged_into(&self, branch: &str, target: &str) -> Result<bool, WorktreeError> {
        let repo = self.open()?;
        let Ok(branch_ref) = repo.find_branch(branch, BranchType::Local) else {
            return Ok(false);
        };
        let branch_oid = branch_ref.get().peel_to_commit()?.id();
        let target_oid = repo
            .find_branch(target, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .id();
        if branch_oid == target_oid {
            return Ok(true);
        }
        Ok(repo.graph_descendant_of(target_oid, branch_oid)?)
    }

    /// Ensure a working tree at `path` checked out to `branch_name` exists,
    /// creating `branch_name` from `base_branch` if absent.
    ///
    /// - Path exists and is a registered tree on the right branch: returned
    ///   unchanged.
    /// - Path exists but is orphaned (directory on disk, no registration)
    ///   or on the wrong branch: force-deleted and pruned, then recreated.
    pub fn ensure(
        &self,
        branch_name: &str,
        path: &Path,
        base_branch: &str,
    ) -> Result<PathBuf, WorktreeError> {
        let repo = self.open()?;
        let tree_name = worktree_name(path);

        if path.exists() {
            if self.is_registered_at(&repo, &tree_name, path) {
                match Repository::open(path)
                    .ok()
                    .and_then(|wt| wt.head().ok()?.shorthand().map(str::to_string))
                {
                    Some(head) if head == branch_name => {
                        debug!(path = %path.display(), branch = branch_name, "worktree already in place");
                        return Ok(path.to_path_buf());
                    }
                    other => {
                        warn!(
                            path = %path.display(),
                            found = ?other,
                            expected = branch_name,
                            "worktree on unexpected branch, recreating"
                        );
                        self.remove(path, true)?;
                    }
                }
            } else {
                warn!(path = %path.display(), "orphaned directory at worktree path, removing");
                std::fs::remove_dir_all(path).map_err(|source| WorktreeError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                self.prune()?;
            }
        } else {
            // A stale registration with no directory blocks re-adding under
            // the same name.
            self.prune()?;
        }

        if repo.find_branch(branch_name, BranchType::Local).is_err() {
            let base = repo
                .find_branch(base_branch, BranchType::Local)?
                .get()
                .peel_to_commit()?;
            repo.branch(branch_name, &base, false)?;
            debug!(branch = branch_name, base = base_branch, "branch created");
        }

        let branch_ref = repo
            .find_branch(branch_name, BranchType::Local)?
            .into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(&tree_name, path, Some(&opts))?;
        debug!(path = %path.display(), branch = branch_name, "worktree added");
        Ok(path.to_path_buf())
    }

    /// Remove the tree at `path`. Registration removal failures (common
    /// when the tree holds untracked files) fall back to recursive
    /// directory deletion followed by a prune.
    pub fn remove(&self, path: &Path, force: bool) -> Result<(), WorktreeError> {
        let repo = self.open()?;
        let tree_name = worktree_name(path);

        let pruned = repo
            .find_worktree(&tree_name)
            .and_then(|wt| {
                let mut opts = WorktreePruneOptions::new();
                opts.valid(true).working_tree(force).locked(force);
                wt.prune(Some(&mut opts))
            })
            .is_ok();

        if path.exists() {
            std::fs::remove_dir_all(path).map_err(|source| WorktreeError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        if !pruned {
            self.prune()?;
        }
        debug!(path = %path.display(), "worktree removed");
        Ok(())
    }

    /// Drop registrations whose directories no longer exist.
    pub fn prune(&self) -> Result<(), WorktreeError> {
        let repo = self.open()?;
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(wt) = repo.find_worktree(name) else {
                continue;
            };
            if !wt.path().exists() {
                let mut opts = WorktreePruneOptions::new();
                opts.valid(true);
                if let Err(e) = wt.prune(Some(&mut opts)) {
                    warn!(name, error = %e, "failed to prune stale worktree");
                }
            }
        }
        Ok(())
    }

    fn is_registered_at(&self, repo: &Repository, name: &str, path: &Path) -> bool {
        repo.find_worktree(name)
            .map(|wt| same_path(wt.path(), path))
            .unwrap_or(false)
    }
}

fn worktree_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "worktree".to_string())
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
