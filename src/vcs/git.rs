use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{MergeOutcome, VersionControl, Worktree, WorktreeSpec};
use crate::error::{AppError, Result};

pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await
            .map_err(|e| AppError::collaborator("git", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr, "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::collaborator(
                "git",
                format!("git {} failed: {}", args.join(" "), stderr.trim()),
            ));
        }

        Ok(output)
    }

    pub async fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"]).await?;
        Ok(())
    }

    /// Returns false when there was nothing to commit.
    pub async fn commit(&self, message: &str) -> Result<bool> {
        let output = self.run(&["commit", "-m", message]).await?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                return Ok(false);
            }
            return Err(AppError::collaborator("git", stderr.trim().to_string()));
        }

        Ok(true)
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch]).await?;
        Ok(())
    }

    pub async fn conflicted_files(&self) -> Result<Vec<String>> {
        let output = self
            .run_checked(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Worktrees live under `<worktrees_dir>/<run_id>`, one branch per run.
/// Merges into the same repository run one at a time.
pub struct GitVersionControl {
    worktrees_dir: PathBuf,
    merge_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl GitVersionControl {
    pub fn new(worktrees_dir: impl Into<PathBuf>) -> Self {
        Self {
            worktrees_dir: worktrees_dir.into(),
            merge_locks: DashMap::new(),
        }
    }

    fn worktree_path(&self, run_id: &str) -> PathBuf {
        self.worktrees_dir.join(run_id)
    }

    fn merge_lock(&self, repo_path: &Path) -> Arc<Mutex<()>> {
        self.merge_locks
            .entry(repo_path.to_path_buf())
            .or_default()
            .clone()
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| AppError::collaborator("git", format!("non-UTF-8 path {}", path.display())))
}

#[async_trait]
impl VersionControl for GitVersionControl {
    async fn create_worktree(&self, spec: &WorktreeSpec) -> Result<Worktree> {
        tokio::fs::create_dir_all(&self.worktrees_dir).await?;

        let path = self.worktree_path(&spec.run_id);
        let branch = spec.branch_name();
        let repo = GitRunner::new(&spec.repo_path);
        repo.run_checked(&[
            "worktree",
            "add",
            "-b",
            &branch,
            path_arg(&path)?,
            &spec.base_branch,
        ])
        .await?;

        info!(
            "Created worktree {} on branch {} for run {}",
            path.display(),
            branch,
            spec.run_id
        );
        Ok(Worktree { path, branch })
    }

    async fn merge(&self, spec: &WorktreeSpec, worktree: &Worktree) -> Result<MergeOutcome> {
        let tree = GitRunner::new(&worktree.path);
        tree.add_all().await?;
        tree.commit(&format!("{}: agent changes (run {})", spec.work_order_id, spec.run_id))
            .await?;

        let lock = self.merge_lock(&spec.repo_path);
        let _merging = lock.lock().await;

        let repo = GitRunner::new(&spec.repo_path);
        repo.checkout(&spec.base_branch).await?;

        let message = format!("Merge {} into {}", worktree.branch, spec.base_branch);
        let output = repo
            .run(&["merge", "--no-ff", &worktree.branch, "-m", &message])
            .await?;
        if output.status.success() {
            info!("Merged {} into {}", worktree.branch, spec.base_branch);
            return Ok(MergeOutcome::Merged);
        }

        let files = repo.conflicted_files().await?;
        if files.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::collaborator(
                "git",
                format!("merge failed: {}", stderr.trim()),
            ));
        }

        repo.run_checked(&["merge", "--abort"]).await?;
        warn!(
            "Merge of {} conflicted in {} file(s)",
            worktree.branch,
            files.len()
        );
        Ok(MergeOutcome::Conflict { files })
    }

    async fn cleanup(&self, spec: &WorktreeSpec, worktree: &Worktree) -> Result<()> {
        let repo = GitRunner::new(&spec.repo_path);
        repo.run_checked(&["worktree", "remove", "--force", path_arg(&worktree.path)?])
            .await?;
        // Unmerged branches are expected for failed or canceled runs.
        repo.run(&["branch", "-D", &worktree.branch]).await?;
        debug!("Removed worktree {}", worktree.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        let git = GitRunner::new(dir);
        git.run_checked(&["init", "-b", "main"]).await.unwrap();
        git.run_checked(&["config", "user.email", "test@example.com"])
            .await
            .unwrap();
        git.run_checked(&["config", "user.name", "Test"]).await.unwrap();
        tokio::fs::write(dir.join("README.md"), "hello\n").await.unwrap();
        git.add_all().await.unwrap();
        assert!(git.commit("initial").await.unwrap());
    }

    fn spec(repo: &Path, run_id: &str) -> WorktreeSpec {
        WorktreeSpec {
            run_id: run_id.to_string(),
            work_order_id: "WO-1".to_string(),
            repo_path: repo.to_path_buf(),
            base_branch: "main".to_string(),
        }
    }

    #[tokio::test]
    async fn test_worktree_merge_and_cleanup() {
        let repo = tempfile::tempdir().unwrap();
        let trees = tempfile::tempdir().unwrap();
        init_repo(repo.path()).await;

        let vcs = GitVersionControl::new(trees.path());
        let spec = spec(repo.path(), "0123456789abcdef");
        let worktree = vcs.create_worktree(&spec).await.unwrap();
        assert_eq!(worktree.branch, "run/WO-1-0123456789abcdef");

        tokio::fs::write(worktree.path.join("feature.txt"), "new\n")
            .await
            .unwrap();
        assert_eq!(
            vcs.merge(&spec, &worktree).await.unwrap(),
            MergeOutcome::Merged
        );
        assert!(repo.path().join("feature.txt").exists());

        vcs.cleanup(&spec, &worktree).await.unwrap();
        assert!(!worktree.path.exists());
    }

    #[tokio::test]
    async fn test_parallel_merges_into_one_repo_all_land() {
        let repo = tempfile::tempdir().unwrap();
        let trees = tempfile::tempdir().unwrap();
        init_repo(repo.path()).await;

        let vcs = Arc::new(GitVersionControl::new(trees.path()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let spec = spec(repo.path(), &format!("run-{}", i));
            let worktree = vcs.create_worktree(&spec).await.unwrap();
            tokio::fs::write(worktree.path.join(format!("file-{}.txt", i)), "x\n")
                .await
                .unwrap();
            let vcs = vcs.clone();
            handles.push(tokio::spawn(async move {
                vcs.merge(&spec, &worktree).await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), MergeOutcome::Merged);
        }
        for i in 0..4 {
            assert!(repo.path().join(format!("file-{}.txt", i)).exists());
        }
    }

    #[tokio::test]
    async fn test_conflicting_merge_is_aborted() {
        let repo = tempfile::tempdir().unwrap();
        let trees = tempfile::tempdir().unwrap();
        init_repo(repo.path()).await;

        let vcs = GitVersionControl::new(trees.path());
        let spec = spec(repo.path(), "run-conflict");
        let worktree = vcs.create_worktree(&spec).await.unwrap();

        tokio::fs::write(worktree.path.join("README.md"), "from agent\n")
            .await
            .unwrap();
        tokio::fs::write(repo.path().join("README.md"), "from human\n")
            .await
            .unwrap();
        let git = GitRunner::new(repo.path());
        git.add_all().await.unwrap();
        git.commit("human edit").await.unwrap();

        let outcome = vcs.merge(&spec, &worktree).await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Conflict {
                files: vec!["README.md".to_string()]
            }
        );
        let status = git.run_checked(&["status", "--porcelain"]).await.unwrap();
        assert!(String::from_utf8_lossy(&status.stdout).trim().is_empty());
    }
}
