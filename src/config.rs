//! Layered configuration: built-in defaults, an optional TOML file, then
//! `FOREMAN_`-prefixed environment variables. Command-line overrides are
//! applied by the binary on top of the loaded value.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub runs: RunsConfig,
    pub checks: ChecksConfig,
    pub providers: ProvidersConfig,
    pub budget: BudgetConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Policy knobs consumed by the run controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Maximum builder passes per run before it fails with `iteration_limit`
    pub max_iterations: u32,
    /// Merge straight from `ai_review` when the reviewer approves
    pub auto_merge: bool,
    pub worktrees_dir: String,
    pub logs_dir: String,
    pub log_excerpt_lines: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChecksConfig {
    pub baseline_command: Option<String>,
    pub test_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub default: String,
    pub claude: ProviderCommand,
    pub codex: ProviderCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCommand {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub monthly_budget_usd: f64,
    /// Projected cost of one run, checked against the reserve before launch
    pub estimated_run_cost_usd: f64,
    /// Remaining budget that must survive a launch
    pub reserve_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub reconcile: bool,
    pub autopilot: bool,
    pub shift_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                path: "./.foreman/foreman.db".to_string(),
            },
            runs: RunsConfig {
                max_iterations: 3,
                auto_merge: false,
                worktrees_dir: "./.foreman/worktrees".to_string(),
                logs_dir: "./.foreman/logs/runs".to_string(),
                log_excerpt_lines: 40,
            },
            checks: ChecksConfig::default(),
            providers: ProvidersConfig {
                default: "claude".to_string(),
                claude: ProviderCommand {
                    binary: "claude".to_string(),
                    args: default_claude_args(),
                },
                codex: ProviderCommand {
                    binary: "codex".to_string(),
                    args: default_codex_args(),
                },
            },
            budget: BudgetConfig {
                monthly_budget_usd: 100.0,
                estimated_run_cost_usd: 2.0,
                reserve_usd: 5.0,
            },
            scheduler: SchedulerConfig {
                tick_interval_secs: 30,
                reconcile: true,
                autopilot: true,
                shift_minutes: 120,
            },
        }
    }
}

fn default_claude_args() -> Vec<String> {
    [
        "-p",
        "--output-format",
        "stream-json",
        "--verbose",
        "--permission-mode",
        "bypassPermissions",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_codex_args() -> Vec<String> {
    ["exec", "--full-auto"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let file = match path {
            Some(path) => config::File::with_name(path),
            None => config::File::with_name("foreman").required(false),
        };

        let settings = config::Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("database.path", "./.foreman/foreman.db")?
            .set_default("runs.max_iterations", 3)?
            .set_default("runs.auto_merge", false)?
            .set_default("runs.worktrees_dir", "./.foreman/worktrees")?
            .set_default("runs.logs_dir", "./.foreman/logs/runs")?
            .set_default("runs.log_excerpt_lines", 40)?
            .set_default("providers.default", "claude")?
            .set_default("providers.claude.binary", "claude")?
            .set_default("providers.claude.args", default_claude_args())?
            .set_default("providers.codex.binary", "codex")?
            .set_default("providers.codex.args", default_codex_args())?
            .set_default("budget.monthly_budget_usd", 100.0)?
            .set_default("budget.estimated_run_cost_usd", 2.0)?
            .set_default("budget.reserve_usd", 5.0)?
            .set_default("scheduler.tick_interval_secs", 30)?
            .set_default("scheduler.reconcile", true)?
            .set_default("scheduler.autopilot", true)?
            .set_default("scheduler.shift_minutes", 120)?
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("FOREMAN")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("providers.claude.args")
                    .with_list_parse_key("providers.codex.args")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.database.path)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.runs.max_iterations, 3);
        assert_eq!(config.providers.default, "claude");
        assert_eq!(config.providers.claude.args, default_claude_args());
        assert!(config.checks.test_command.is_none());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        std::fs::write(
            &path,
            "[runs]\nmax_iterations = 5\n\n[checks]\ntest_command = \"cargo test\"\n",
        )
        .unwrap();

        let config = Config::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.runs.max_iterations, 5);
        assert_eq!(config.checks.test_command.as_deref(), Some("cargo test"));
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_database_url() {
        let config = Config::default();
        assert_eq!(
            config.database_url(),
            "sqlite:./.foreman/foreman.db?mode=rwc"
        );
    }
}
