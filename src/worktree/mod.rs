// Worktree and mirror management: a bare mirror per source repo under
// <config>/repos/<project>, environment branches checked out as linked
// worktrees under <config>/worktrees/<project>/<ID>.

use std::path::{Path, PathBuf};

use crate::config;
use crate::git::{Git, GitError, Result};

// Remote added to the source repo, pointing at the mirror.
pub const MIRROR_REMOTE: &str = "container-use";

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    config_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn mirror_path(&self, source: &Path) -> PathBuf {
        self.config_dir
            .join("repos")
            .join(config::project_name(source))
    }

    pub fn worktree_path(&self, source: &Path, id: &str) -> PathBuf {
        self.config_dir
            .join("worktrees")
            .join(config::project_name(source))
            .join(id)
    }

    // Lazy: the bare clone happens on first touch per source repo.
    pub fn ensure_mirror(&self, source: &Path) -> Result<PathBuf> {
        if !Git::is_git_repo(source) {
            return Err(GitError::NotAGitRepo);
        }

        let mirror = self.mirror_path(source);
        if !mirror.exists() {
            std::fs::create_dir_all(mirror.parent().expect("repos dir has a parent"))?;
            tracing::info!(mirror = %mirror.display(), "creating bare mirror");
            let git = Git::new(self.config_dir.clone());
            git.run(&[
                "clone",
                "--bare",
                &source.to_string_lossy(),
                &mirror.to_string_lossy(),
            ])?;
        }

        self.ensure_source_remote(source, &mirror)?;

        // Refresh mirror branches so new environments start from the
        // source's current tips.
        let mirror_git = Git::new(&mirror);
        if let Err(e) = mirror_git.run(&["fetch", "origin", "+refs/heads/*:refs/heads/*"]) {
            // An unborn source repo has nothing to fetch.
            tracing::debug!(error = %e, "mirror fetch skipped");
        }

        Ok(mirror)
    }

    fn ensure_source_remote(&self, source: &Path, mirror: &Path) -> Result<()> {
        let source_git = Git::new(source);
        let mirror_str = mirror.to_string_lossy().to_string();
        match source_git.run(&["remote", "get-url", MIRROR_REMOTE]) {
            Ok(url) if url.trim() == mirror_str => Ok(()),
            Ok(_) => {
                source_git.run(&["remote", "set-url", MIRROR_REMOTE, &mirror_str])?;
                Ok(())
            }
            Err(_) => {
                source_git.run(&["remote", "add", MIRROR_REMOTE, &mirror_str])?;
                Ok(())
            }
        }
    }

    // Create branch <id> in the mirror at the source's current HEAD (or a
    // synthesized empty root commit for an unborn source), check it out as a
    // linked worktree, and push the branch back into the source repo.
    pub fn create_worktree(&self, source: &Path, id: &str) -> Result<PathBuf> {
        let mirror = self.ensure_mirror(source)?;
        let mirror_git = Git::new(&mirror);

        // Drop metadata for worktrees whose directories were removed by hand,
        // so a stale registration can never block a fresh checkout.
        if let Err(e) = mirror_git.run(&["worktree", "prune"]) {
            tracing::debug!(error = %e, "worktree prune skipped");
        }

        let start = self.resolve_start_point(source, &mirror_git)?;
        mirror_git.run(&["branch", id, &start])?;

        let path = self.worktree_path(source, id);
        if path.exists() {
            return Err(GitError::WorktreeAlreadyExists(path));
        }
        std::fs::create_dir_all(path.parent().expect("worktrees dir has a parent"))?;

        mirror_git.run(&["worktree", "add", &path.to_string_lossy(), id])?;
        self.sync_branch_to_source(source, id)?;

        tracing::info!(id = %id, path = %path.display(), "created worktree");
        Ok(path)
    }

    fn resolve_start_point(&self, source: &Path, mirror_git: &Git) -> Result<String> {
        let source_git = Git::new(source);
        match source_git.run(&["rev-parse", "--verify", "HEAD"]) {
            Ok(sha) => Ok(sha.trim().to_string()),
            // Unborn HEAD: no commits in the source yet.
            Err(_) => mirror_git.create_empty_root_commit(),
        }
    }

    // Forced refspec: the branch is owned by its environment, never advanced
    // from the source side.
    pub fn sync_branch_to_source(&self, source: &Path, id: &str) -> Result<()> {
        let refspec = format!("+refs/heads/{id}:refs/heads/{id}");
        Git::new(source).run(&["fetch", MIRROR_REMOTE, &refspec])?;
        Ok(())
    }

    // Forced removal: agent work is already committed, anything else is cache.
    pub fn remove_worktree(&self, source: &Path, id: &str) -> Result<()> {
        let path = self.worktree_path(source, id);
        if !path.exists() {
            return Ok(());
        }
        let mirror_git = Git::new(self.mirror_path(source));
        mirror_git.run(&["worktree", "remove", "--force", &path.to_string_lossy()])?;
        Ok(())
    }

    // The mirror keeps its copy so branch history stays inspectable after
    // environment deletion.
    pub fn delete_branch_from_source(&self, source: &Path, id: &str) -> Result<()> {
        Git::new(source).run(&["branch", "-D", id])?;
        Ok(())
    }

    pub fn list_branches(&self, source: &Path) -> Result<Vec<String>> {
        let mirror = self.mirror_path(source);
        if !mirror.exists() {
            return Ok(Vec::new());
        }
        let out = Git::new(&mirror).run(&[
            "for-each-ref",
            "--format=%(refname:short)",
            "refs/heads",
        ])?;
        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }

    pub fn branch_exists(&self, source: &Path, id: &str) -> bool {
        let mirror = self.mirror_path(source);
        if !mirror.exists() {
            return false;
        }
        Git::new(&mirror)
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{id}"),
            ])
            .is_ok()
    }
}
