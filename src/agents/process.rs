use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::output::{parse_claude_stream_line, parse_markers, OutputSignal};
use super::{AgentExit, AgentProvider, AgentRequest, AgentSession};
use crate::config::ProviderCommand;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    ClaudeStreamJson,
    PlainText,
}

/// Agent CLI launched as `<binary> <args...> <prompt>` inside the worktree.
pub struct CliAgentProvider {
    name: String,
    command: ProviderCommand,
    format: OutputFormat,
}

impl CliAgentProvider {
    pub fn new(name: impl Into<String>, command: ProviderCommand, format: OutputFormat) -> Self {
        Self {
            name: name.into(),
            command,
            format,
        }
    }
}

#[async_trait]
impl AgentProvider for CliAgentProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, request: AgentRequest) -> Result<Box<dyn AgentSession>> {
        info!(
            "Starting {} {} for run {} in {}",
            self.name,
            request.role,
            request.run_id,
            request.workdir.display()
        );

        let mut cmd = Command::new(&self.command.binary);
        cmd.args(&self.command.args)
            .arg(&request.prompt)
            .current_dir(&request.workdir)
            .env("FOREMAN_RUN_ID", &request.run_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Executing command: {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| {
            AppError::collaborator(
                format!("provider:{}", self.name),
                format!("failed to spawn '{}': {}", self.command.binary, e),
            )
        })?;

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        let pid = child.id();
        info!("Agent process for run {} spawned with PID {:?}", request.run_id, pid);

        Ok(Box::new(ProcessSession {
            name: self.name.clone(),
            pid,
            child,
            lines: rx,
        }))
    }

    fn parse_output(&self, line: &str) -> Vec<OutputSignal> {
        match self.format {
            OutputFormat::ClaudeStreamJson => parse_claude_stream_line(line),
            OutputFormat::PlainText => parse_markers(line),
        }
    }
}

async fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Stopped reading agent output: {}", e);
                break;
            }
        }
    }
}

struct ProcessSession {
    name: String,
    pid: Option<u32>,
    child: Child,
    lines: mpsc::Receiver<String>,
}

#[async_trait]
impl AgentSession for ProcessSession {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    async fn wait(&mut self) -> Result<AgentExit> {
        let status = self.child.wait().await.map_err(|e| {
            AppError::collaborator(format!("provider:{}", self.name), e.to_string())
        })?;
        Ok(AgentExit {
            success: status.success(),
            code: status.code(),
        })
    }

    async fn kill(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(AppError::collaborator(
                format!("provider:{}", self.name),
                e.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRole;

    fn shell_provider(script: &str) -> CliAgentProvider {
        CliAgentProvider::new(
            "shell",
            ProviderCommand {
                binary: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string(), "agent".to_string()],
            },
            OutputFormat::PlainText,
        )
    }

    #[tokio::test]
    async fn test_cli_session_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let provider = shell_provider("echo working; echo \"@@DONE\"; echo oops >&2");
        let mut session = provider
            .start(AgentRequest {
                run_id: "run-1".to_string(),
                role: AgentRole::Builder,
                prompt: "build it".to_string(),
                workdir: dir.path().to_path_buf(),
            })
            .await
            .unwrap();

        let mut lines = Vec::new();
        while let Some(line) = session.next_line().await {
            lines.push(line);
        }
        let exit = session.wait().await.unwrap();

        assert!(exit.success);
        assert!(lines.contains(&"working".to_string()));
        assert!(lines.contains(&"oops".to_string()));
        let signals: Vec<_> = lines.iter().flat_map(|l| provider.parse_output(l)).collect();
        assert_eq!(signals, vec![OutputSignal::Done(None)]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_collaborator_error() {
        let provider = CliAgentProvider::new(
            "ghost",
            ProviderCommand {
                binary: "/nonexistent/agent-binary".to_string(),
                args: vec![],
            },
            OutputFormat::PlainText,
        );
        let err = provider
            .start(AgentRequest {
                run_id: "run-1".to_string(),
                role: AgentRole::Reviewer,
                prompt: "review".to_string(),
                workdir: std::env::temp_dir(),
            })
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "collaborator");
    }
}
