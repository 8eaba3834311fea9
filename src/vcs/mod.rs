//! Isolated per-run worktrees and merging them back.

pub mod git;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;

pub use git::GitVersionControl;

#[derive(Debug, Clone)]
pub struct WorktreeSpec {
    pub run_id: String,
    pub work_order_id: String,
    pub repo_path: PathBuf,
    pub base_branch: String,
}

impl WorktreeSpec {
    pub fn branch_name(&self) -> String {
        format!("run/{}-{}", self.work_order_id, self.run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged,
    Conflict { files: Vec<String> },
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn create_worktree(&self, spec: &WorktreeSpec) -> Result<Worktree>;

    /// Commits pending worktree changes and merges the run branch into base.
    async fn merge(&self, spec: &WorktreeSpec, worktree: &Worktree) -> Result<MergeOutcome>;

    async fn cleanup(&self, spec: &WorktreeSpec, worktree: &Worktree) -> Result<()>;
}
