//! Coding agents driven as child processes.

pub mod output;
pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ProvidersConfig;
use crate::error::{AppError, Result};

pub use output::{OutputSignal, Verdict};
pub use process::{CliAgentProvider, OutputFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Builder,
    Reviewer,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Builder => f.write_str("builder"),
            AgentRole::Reviewer => f.write_str("reviewer"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: String,
    pub role: AgentRole,
    pub prompt: String,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    pub success: bool,
    pub code: Option<i32>,
}

/// A launched agent. Output lines arrive merged from stdout and stderr.
#[async_trait]
pub trait AgentSession: Send {
    fn pid(&self) -> Option<u32>;

    /// Next output line, or `None` once both streams are closed.
    async fn next_line(&mut self) -> Option<String>;

    async fn wait(&mut self) -> Result<AgentExit>;

    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait AgentProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, request: AgentRequest) -> Result<Box<dyn AgentSession>>;

    /// Extracts structured signals from one output line.
    fn parse_output(&self, line: &str) -> Vec<OutputSignal>;
}

/// Providers addressable by name, e.g. `claude` or `codex`.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AgentProvider>>,
    default: String,
}

impl ProviderRegistry {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default: default.into(),
        }
    }

    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut registry = Self::new(&config.default);
        registry.register(Arc::new(CliAgentProvider::new(
            "claude",
            config.claude.clone(),
            OutputFormat::ClaudeStreamJson,
        )));
        registry.register(Arc::new(CliAgentProvider::new(
            "codex",
            config.codex.clone(),
            OutputFormat::PlainText,
        )));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn AgentProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn AgentProvider>> {
        let name = name.unwrap_or(&self.default);
        self.providers.get(name).cloned().ok_or_else(|| {
            let mut known: Vec<&str> = self.providers.keys().map(String::as_str).collect();
            known.sort_unstable();
            AppError::Validation(format!(
                "unknown provider '{}' (known: {})",
                name,
                known.join(", ")
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_registry_resolves_configured_providers() {
        let registry = ProviderRegistry::from_config(&Config::default().providers);
        assert_eq!(registry.resolve(None).unwrap().name(), "claude");
        assert_eq!(registry.resolve(Some("codex")).unwrap().name(), "codex");

        let err = registry.resolve(Some("gpt")).err().unwrap();
        assert!(matches!(err, AppError::Validation(ref m) if m.contains("claude, codex")));
    }
}
