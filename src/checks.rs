//! Baseline and test commands run inside a run's worktree.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ChecksConfig;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Baseline,
    Tests,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub output: String,
}

impl CheckOutcome {
    pub fn skipped() -> Self {
        Self {
            passed: true,
            output: String::new(),
        }
    }
}

#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run(&self, kind: CheckKind, workdir: &Path) -> Result<CheckOutcome>;
}

/// Runs configured commands through `sh -c`. An unset command passes.
pub struct CommandCheckRunner {
    config: ChecksConfig,
}

impl CommandCheckRunner {
    pub fn new(config: ChecksConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CheckRunner for CommandCheckRunner {
    async fn run(&self, kind: CheckKind, workdir: &Path) -> Result<CheckOutcome> {
        let command = match kind {
            CheckKind::Baseline => self.config.baseline_command.as_deref(),
            CheckKind::Tests => self.config.test_command.as_deref(),
        };
        let Some(command) = command.filter(|c| !c.trim().is_empty()) else {
            debug!("No {:?} command configured, skipping", kind);
            return Ok(CheckOutcome::skipped());
        };

        info!("Running {:?} check `{}` in {}", kind, command, workdir.display());
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .output()
            .await
            .map_err(|e| AppError::collaborator("checks", e.to_string()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CheckOutcome {
            passed: output.status.success(),
            output: text,
        })
    }
}
