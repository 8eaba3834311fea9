//! Shared harness for integration tests: a temp database plus scripted
//! agents, version control, checks and process probe.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use foreman::{
    agents::{
        output::parse_markers, AgentExit, AgentProvider, AgentRequest, AgentRole, AgentSession,
        OutputSignal, ProviderRegistry,
    },
    checks::{CheckKind, CheckOutcome, CheckRunner},
    config::Config,
    database::{
        self,
        projects::{CreateProjectRequest, Project},
        runs::Run,
        work_orders::{CreateWorkOrderRequest, WorkOrder, WorkOrderStatus},
    },
    error::{AppError, Result},
    runs::{Collaborators, ProcessProbe, RunStatus},
    server::AppState,
    vcs::{MergeOutcome, VersionControl, Worktree, WorktreeSpec},
};

/// One scripted agent process.
#[derive(Debug, Clone)]
pub struct Script {
    pub lines: Vec<String>,
    pub exit: AgentExit,
    /// Keep the process "running" after the last line until killed.
    pub hold: bool,
}

impl Script {
    pub fn lines(lines: &[&str], code: i32) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            exit: AgentExit {
                success: code == 0,
                code: Some(code),
            },
            hold: false,
        }
    }

    pub fn done() -> Self {
        Self::lines(&["working", "@@DONE {\"summary\": \"finished\"}"], 0)
    }

    pub fn approve() -> Self {
        Self::lines(&["@@VERDICT {\"verdict\": \"approved\", \"notes\": \"looks good\"}"], 0)
    }

    pub fn request_changes(notes: &str) -> Self {
        let line = format!(
            "@@VERDICT {{\"verdict\": \"changes_requested\", \"notes\": \"{}\"}}",
            notes
        );
        Self::lines(&[line.as_str()], 0)
    }

    pub fn escalate(key: &str) -> Self {
        let line = format!(
            "@@ESCALATION {{\"what_i_tried\": \"searched the repo\", \"what_i_need\": \"a value for {key}\", \"inputs\": [{{\"key\": \"{key}\", \"label\": \"{key}\"}}]}}"
        );
        Self::lines(&["looking around", line.as_str(), "never printed"], 0)
    }

    pub fn hang() -> Self {
        Self {
            lines: vec!["started".to_string()],
            exit: AgentExit {
                success: true,
                code: Some(0),
            },
            hold: true,
        }
    }
}

#[derive(Default)]
struct ProviderState {
    builder: VecDeque<Script>,
    reviewer: VecDeque<Script>,
    prompts: Vec<(AgentRole, String)>,
}

/// Agent provider that replays queued scripts per role. Builders default to
/// `@@DONE`, reviewers to an approval.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ProviderState>>,
    started: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn push_builder(&self, script: Script) {
        self.state.lock().unwrap().builder.push_back(script);
    }

    pub fn push_reviewer(&self, script: Script) {
        self.state.lock().unwrap().reviewer.push_back(script);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn prompts(&self, role: AgentRole) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .prompts
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self, request: AgentRequest) -> Result<Box<dyn AgentSession>> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.prompts.push((request.role, request.prompt.clone()));
            match request.role {
                AgentRole::Builder => state.builder.pop_front().unwrap_or_else(Script::done),
                AgentRole::Reviewer => state.reviewer.pop_front().unwrap_or_else(Script::approve),
            }
        };
        let pid = 40_000 + self.started.fetch_add(1, Ordering::SeqCst) as u32;
        Ok(Box::new(ScriptedSession {
            pid,
            lines: script.lines.into_iter().collect(),
            exit: script.exit,
            hold: script.hold,
            killed: false,
        }))
    }

    fn parse_output(&self, line: &str) -> Vec<OutputSignal> {
        parse_markers(line)
    }
}

struct ScriptedSession {
    pid: u32,
    lines: VecDeque<String>,
    exit: AgentExit,
    hold: bool,
    killed: bool,
}

#[async_trait]
impl AgentSession for ScriptedSession {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn next_line(&mut self) -> Option<String> {
        if let Some(line) = self.lines.pop_front() {
            return Some(line);
        }
        if self.hold && !self.killed {
            std::future::pending::<()>().await;
        }
        None
    }

    async fn wait(&mut self) -> Result<AgentExit> {
        if self.killed {
            return Ok(AgentExit {
                success: false,
                code: None,
            });
        }
        Ok(self.exit)
    }

    async fn kill(&mut self) -> Result<()> {
        self.killed = true;
        Ok(())
    }
}

/// Worktrees are plain directories; merges follow a queue of outcomes.
#[derive(Clone)]
pub struct FakeVcs {
    root: PathBuf,
    merges: Arc<Mutex<VecDeque<MergeOutcome>>>,
    cleaned: Arc<Mutex<Vec<String>>>,
    fail_create: Arc<AtomicBool>,
    fail_merge: Arc<AtomicBool>,
}

impl FakeVcs {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            merges: Arc::default(),
            cleaned: Arc::default(),
            fail_create: Arc::default(),
            fail_merge: Arc::default(),
        }
    }

    pub fn push_merge(&self, outcome: MergeOutcome) {
        self.merges.lock().unwrap().push_back(outcome);
    }

    pub fn cleaned(&self) -> Vec<String> {
        self.cleaned.lock().unwrap().clone()
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_merge(&self) {
        self.fail_merge.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn create_worktree(&self, spec: &WorktreeSpec) -> Result<Worktree> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(AppError::collaborator("git", "worktree add failed"));
        }
        let path = self.root.join(&spec.run_id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(Worktree {
            path,
            branch: spec.branch_name(),
        })
    }

    async fn merge(&self, _spec: &WorktreeSpec, _worktree: &Worktree) -> Result<MergeOutcome> {
        if self.fail_merge.swap(false, Ordering::SeqCst) {
            return Err(AppError::collaborator("git", "index.lock exists"));
        }
        Ok(self
            .merges
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MergeOutcome::Merged))
    }

    async fn cleanup(&self, spec: &WorktreeSpec, _worktree: &Worktree) -> Result<()> {
        self.cleaned.lock().unwrap().push(spec.run_id.clone());
        Ok(())
    }
}

/// Baseline passes unless told otherwise; test outcomes follow a queue.
#[derive(Clone, Default)]
pub struct FakeChecks {
    baseline_fails: Arc<AtomicBool>,
    tests: Arc<Mutex<VecDeque<CheckOutcome>>>,
}

impl FakeChecks {
    pub fn fail_baseline(&self) {
        self.baseline_fails.store(true, Ordering::SeqCst);
    }

    pub fn push_test(&self, passed: bool, output: &str) {
        self.tests.lock().unwrap().push_back(CheckOutcome {
            passed,
            output: output.to_string(),
        });
    }
}

#[async_trait]
impl CheckRunner for FakeChecks {
    async fn run(&self, kind: CheckKind, _workdir: &Path) -> Result<CheckOutcome> {
        match kind {
            CheckKind::Baseline if self.baseline_fails.load(Ordering::SeqCst) => Ok(CheckOutcome {
                passed: false,
                output: "baseline: 2 tests failing".to_string(),
            }),
            CheckKind::Baseline => Ok(CheckOutcome::skipped()),
            CheckKind::Tests => Ok(self
                .tests
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(CheckOutcome::skipped)),
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeProbe {
    alive: Arc<Mutex<HashSet<u32>>>,
    terminated: Arc<Mutex<Vec<u32>>>,
}

impl FakeProbe {
    pub fn set_alive(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().clone()
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn terminate(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
        self.terminated.lock().unwrap().push(pid);
    }
}

pub struct TestHarness {
    pub state: AppState,
    pub provider: ScriptedProvider,
    pub vcs: FakeVcs,
    pub checks: FakeChecks,
    pub probe: FakeProbe,
    _dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = Config::default();
        config.database.path = dir.path().join("foreman.db").to_string_lossy().into_owned();
        config.runs.worktrees_dir = dir.path().join("worktrees").to_string_lossy().into_owned();
        config.runs.logs_dir = dir.path().join("logs").to_string_lossy().into_owned();
        config.providers.default = "scripted".to_string();
        adjust(&mut config);

        let db = database::create_pool(&config.database_url())
            .await
            .expect("database pool");

        let provider = ScriptedProvider::default();
        let mut registry = ProviderRegistry::new("scripted");
        registry.register(Arc::new(provider.clone()));

        let vcs = FakeVcs::new(&dir.path().join("worktrees"));
        let checks = FakeChecks::default();
        let probe = FakeProbe::default();
        let collaborators = Collaborators {
            providers: Arc::new(registry),
            vcs: Arc::new(vcs.clone()),
            checks: Arc::new(checks.clone()),
            probe: Arc::new(probe.clone()),
        };

        Self {
            state: AppState::new(config, db, collaborators),
            provider,
            vcs,
            checks,
            probe,
            _dir: dir,
        }
    }

    pub async fn project(&self, name: &str) -> Project {
        Project::create(
            &self.state.db,
            CreateProjectRequest {
                name: name.to_string(),
                path: "/tmp/foreman-test-repo".to_string(),
                base_branch: None,
            },
        )
        .await
        .expect("project")
    }

    pub async fn ready_work_order(&self, project_id: &str, title: &str) -> WorkOrder {
        self.work_order(project_id, ready_request(title)).await
    }

    pub async fn work_order(&self, project_id: &str, req: CreateWorkOrderRequest) -> WorkOrder {
        WorkOrder::create(&self.state.db, project_id, req)
            .await
            .expect("work order")
    }

    pub async fn run(&self, run_id: &str) -> Run {
        Run::require(&self.state.db, run_id).await.expect("run")
    }

    pub async fn work_order_status(&self, work_order_id: &str) -> WorkOrderStatus {
        WorkOrder::require(&self.state.db, work_order_id)
            .await
            .expect("work order")
            .status
    }

    /// Polls until the run rests in `status` and no driver owns it.
    pub async fn wait_for(&self, run_id: &str, status: RunStatus) -> Run {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let run = self.run(run_id).await;
            if run.status == status && !self.state.controller.is_driving(run_id) {
                return run;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "run {} stuck in {} waiting for {}",
                    run_id, run.status, status
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Polls until some driver owns the run and it sits in `status`.
    pub async fn wait_while_driving(&self, run_id: &str, status: RunStatus) -> Run {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let run = self.run(run_id).await;
            if run.status == status && self.state.controller.is_driving(run_id) {
                return run;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("run {} never reached a driven {}", run_id, status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub fn ready_request(title: &str) -> CreateWorkOrderRequest {
    CreateWorkOrderRequest {
        title: title.to_string(),
        goal: format!("Implement {}", title),
        acceptance_criteria: vec!["tests pass".to_string()],
        stop_conditions: vec!["stop if the schema must change".to_string()],
        status: Some(WorkOrderStatus::Ready),
        ..Default::default()
    }
}
