use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::drivers::DriverRegistry;
use super::prompts::{builder_prompt, reviewer_prompt, tail_lines};
use super::recovery::{ProcessProbe, SystemProbe};
use super::status::{failure_reason, ReviewerVerdict, RunEvent, RunStatus, TriggeredBy};
use crate::agents::{
    AgentExit, AgentProvider, AgentRequest, AgentRole, AgentSession, OutputSignal, ProviderRegistry,
};
use crate::budget::BudgetMeter;
use crate::checks::{CheckKind, CheckRunner, CommandCheckRunner};
use crate::communications::EscalationRouter;
use crate::config::{Config, RunsConfig};
use crate::database::projects::Project;
use crate::database::runs::{NewRun, Run, RunPatch};
use crate::database::work_orders::{WorkOrder, WorkOrderStatus};
use crate::database::DbPool;
use crate::error::{AppError, Result};
use crate::runs::escalation::EscalationPayload;
use crate::vcs::{GitVersionControl, MergeOutcome, VersionControl, Worktree, WorktreeSpec};

/// External pieces the controller drives. Tests swap in fakes.
#[derive(Clone)]
pub struct Collaborators {
    pub providers: Arc<ProviderRegistry>,
    pub vcs: Arc<dyn VersionControl>,
    pub checks: Arc<dyn CheckRunner>,
    pub probe: Arc<dyn ProcessProbe>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> Self {
        Self {
            providers: Arc::new(ProviderRegistry::from_config(&config.providers)),
            vcs: Arc::new(GitVersionControl::new(&config.runs.worktrees_dir)),
            checks: Arc::new(CommandCheckRunner::new(config.checks.clone())),
            probe: Arc::new(SystemProbe),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRunRequest {
    pub work_order_id: String,
    pub provider: Option<String>,
}

/// Operator patch. `status` only accepts `merged` (after a manual conflict
/// resolution) and `canceled`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatchRunRequest {
    pub status: Option<RunStatus>,
    pub merge_status: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityVerdict {
    Clear,
    Reject,
}

/// What one agent pass produced.
#[derive(Debug, Default)]
struct PassOutput {
    done: bool,
    escalation: Option<EscalationPayload>,
    verdict: Option<(ReviewerVerdict, Option<String>)>,
    cost_usd: f64,
    exit: Option<AgentExit>,
    stopped: bool,
    excerpt: String,
}

/// Per-run log file plus a rolling excerpt kept for the run row.
struct RunLog {
    file: Option<tokio::fs::File>,
    excerpt: VecDeque<String>,
    capacity: usize,
}

impl RunLog {
    async fn open(path: &str, capacity: usize) -> Self {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Failed to create log directory {}: {}", parent.display(), e);
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| warn!("Failed to open run log {}: {}", path.display(), e))
            .ok();
        Self {
            file,
            excerpt: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    async fn append(&mut self, line: &str) {
        if let Some(file) = self.file.as_mut() {
            let mut buf = String::with_capacity(line.len() + 1);
            buf.push_str(line);
            buf.push('\n');
            if let Err(e) = file.write_all(buf.as_bytes()).await {
                warn!("Failed to write run log: {}", e);
                self.file = None;
            }
        }
        if self.excerpt.len() == self.capacity {
            self.excerpt.pop_front();
        }
        self.excerpt.push_back(line.to_string());
    }

    fn excerpt(&self) -> String {
        self.excerpt.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Owns the run state machine. Every status write is a compare-and-swap in
/// the store; the in-process registry only tracks which runs this instance
/// is currently driving so they can be stopped.
#[derive(Clone)]
pub struct RunController {
    db: DbPool,
    config: RunsConfig,
    collaborators: Collaborators,
    budget: BudgetMeter,
    router: EscalationRouter,
    drivers: DriverRegistry,
}

impl RunController {
    pub fn new(
        db: DbPool,
        config: RunsConfig,
        collaborators: Collaborators,
        budget: BudgetMeter,
        router: EscalationRouter,
    ) -> Self {
        Self {
            db,
            config,
            collaborators,
            budget,
            router,
            drivers: DriverRegistry::default(),
        }
    }

    pub fn is_driving(&self, run_id: &str) -> bool {
        self.drivers.contains(run_id)
    }

    pub async fn get(&self, run_id: &str) -> Result<Run> {
        Run::require(&self.db, run_id).await
    }

    pub async fn list(
        &self,
        project_id: Option<&str>,
        status: Option<RunStatus>,
    ) -> Result<Vec<Run>> {
        Run::list(&self.db, project_id, status).await
    }

    /// Inserts a `queued` run after the Ready and budget gates.
    pub async fn create_run(
        &self,
        project_id: &str,
        work_order_id: &str,
        triggered_by: TriggeredBy,
        provider: Option<&str>,
    ) -> Result<Run> {
        Project::require(&self.db, project_id).await?;
        let work_order = WorkOrder::require(&self.db, work_order_id).await?;
        if work_order.project_id != project_id {
            return Err(AppError::NotFound(format!(
                "Work order '{}' not found in project '{}'",
                work_order_id, project_id
            )));
        }

        if Run::active_for_work_order(&self.db, work_order_id)
            .await?
            .is_some()
        {
            return Err(AppError::ActiveRunExists {
                work_order_id: work_order_id.to_string(),
            });
        }

        let check = work_order.ready_check();
        if !check.ok {
            return Err(AppError::NotReady {
                work_order_id: work_order_id.to_string(),
                missing: check.missing_fields(),
            });
        }
        if work_order.status != WorkOrderStatus::Ready {
            return Err(AppError::Validation(format!(
                "work order '{}' is '{}', runs start only from 'ready'",
                work_order_id, work_order.status
            )));
        }

        let provider = self.collaborators.providers.resolve(provider)?;
        self.budget.check_run_allowed(project_id).await?;

        let run_id = Uuid::new_v4().to_string();
        let log_path = PathBuf::from(&self.config.logs_dir).join(format!("{}.log", run_id));

        Run::insert(
            &self.db,
            NewRun {
                id: run_id,
                project_id: project_id.to_string(),
                work_order_id: work_order_id.to_string(),
                provider: provider.name().to_string(),
                triggered_by,
                log_path: log_path.to_string_lossy().into_owned(),
            },
        )
        .await
    }

    /// Creates the run and drives it in the background.
    pub async fn launch(
        &self,
        project_id: &str,
        work_order_id: &str,
        triggered_by: TriggeredBy,
        provider: Option<&str>,
    ) -> Result<Run> {
        let run = self
            .create_run(project_id, work_order_id, triggered_by, provider)
            .await?;
        self.spawn_drive(&run.id);
        Ok(run)
    }

    pub fn spawn_drive(&self, run_id: &str) {
        let controller = self.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = controller.drive(&run_id).await {
                error!(run_id = %run_id, "Run driver stopped with error: {}", e);
            }
        });
    }

    /// Advances the run until it reaches a status that waits on someone
    /// else. Safe to call again for the same run; a second concurrent call
    /// returns immediately and the running driver re-reads the run before
    /// it goes idle.
    pub async fn drive(&self, run_id: &str) -> Result<()> {
        let Some(mut slot) = self.drivers.claim(run_id) else {
            debug!(run_id = %run_id, "Run is already being driven");
            return Ok(());
        };

        loop {
            if *slot.stop.borrow() {
                break;
            }

            let run = Run::require(&self.db, run_id).await?;
            let step = match run.status {
                RunStatus::Queued => self.start_building(&run).await,
                RunStatus::Building => self.build_phase(&run, &mut slot.stop).await,
                RunStatus::Testing => self.test_phase(&run).await,
                RunStatus::AiReview => self.review_phase(&run, &mut slot.stop).await,
                status => {
                    if slot.release() {
                        debug!(run_id = %run_id, status = %status, "Run is resting");
                        break;
                    }
                    debug!(run_id = %run_id, status = %status, "Drive requested while resting, re-reading");
                    continue;
                }
            };

            match step {
                Ok(()) => {}
                Err(AppError::StaleTransition { actual, .. }) => {
                    debug!(run_id = %run_id, actual = %actual, "Run moved underneath the driver");
                }
                Err(e) => {
                    error!(run_id = %run_id, status = %run.status, "Run step failed: {}", e);
                    self.fail_operational(run_id, &e).await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn fail_operational(&self, run_id: &str, cause: &AppError) {
        let run = match Run::require(&self.db, run_id).await {
            Ok(run) => run,
            Err(e) => {
                error!(run_id = %run_id, "Could not reload run to fail it: {}", e);
                return;
            }
        };
        if run.status.apply(RunEvent::OperationalFailure).is_none() {
            return;
        }
        let reason = if run.status == RunStatus::Queued {
            failure_reason::WORKTREE_FAILED
        } else {
            failure_reason::AGENT_CRASHED
        };
        match Run::transition(
            &self.db,
            run_id,
            run.status,
            RunEvent::OperationalFailure,
            RunPatch::failure(reason, cause.to_string()),
        )
        .await
        {
            Ok(failed) => self.release_worktree(&failed).await,
            Err(e) => warn!(run_id = %run_id, "Could not mark run failed: {}", e),
        }
    }

    async fn worktree_spec(&self, run: &Run) -> Result<WorktreeSpec> {
        let project = Project::require(&self.db, &run.project_id).await?;
        let work_order = WorkOrder::require(&self.db, &run.work_order_id).await?;
        Ok(WorktreeSpec {
            run_id: run.id.clone(),
            work_order_id: run.work_order_id.clone(),
            repo_path: PathBuf::from(&project.path),
            base_branch: work_order
                .effective_base_branch(&project.base_branch)
                .to_string(),
        })
    }

    fn worktree_of(run: &Run) -> Option<Worktree> {
        match (&run.run_dir, &run.branch) {
            (Some(dir), Some(branch)) => Some(Worktree {
                path: PathBuf::from(dir),
                branch: branch.clone(),
            }),
            _ => None,
        }
    }

    fn require_worktree(run: &Run) -> Result<Worktree> {
        Self::worktree_of(run).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("run '{}' has no worktree", run.id))
        })
    }

    /// Only called once the run is terminal. Failures are logged.
    async fn release_worktree(&self, run: &Run) {
        if !run.status.is_terminal() {
            return;
        }
        let Some(worktree) = Self::worktree_of(run) else {
            return;
        };
        let spec = match self.worktree_spec(run).await {
            Ok(spec) => spec,
            Err(e) => {
                warn!(run_id = %run.id, "Cannot resolve worktree for cleanup: {}", e);
                return;
            }
        };
        match self.collaborators.vcs.cleanup(&spec, &worktree).await {
            Ok(()) => info!(run_id = %run.id, path = %worktree.path.display(), "Released worktree"),
            Err(e) => warn!(run_id = %run.id, "Worktree cleanup failed: {}", e),
        }
    }

    async fn start_building(&self, run: &Run) -> Result<()> {
        let spec = self.worktree_spec(run).await?;
        let worktree = match self.collaborators.vcs.create_worktree(&spec).await {
            Ok(worktree) => worktree,
            Err(e) => {
                let failed = Run::transition(
                    &self.db,
                    &run.id,
                    RunStatus::Queued,
                    RunEvent::OperationalFailure,
                    RunPatch::failure(failure_reason::WORKTREE_FAILED, e.to_string()),
                )
                .await?;
                warn!(run_id = %failed.id, "Worktree creation failed: {}", e);
                return Ok(());
            }
        };

        Run::transition(
            &self.db,
            &run.id,
            RunStatus::Queued,
            RunEvent::Start,
            RunPatch {
                run_dir: Some(worktree.path.to_string_lossy().into_owned()),
                branch: Some(worktree.branch.clone()),
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    async fn build_phase(&self, run: &Run, stop: &mut watch::Receiver<bool>) -> Result<()> {
        let worktree = Self::require_worktree(run)?;

        if !run.baseline_passed {
            let baseline = self
                .collaborators
                .checks
                .run(CheckKind::Baseline, &worktree.path)
                .await?;
            if !baseline.passed {
                let excerpt = tail_lines(&baseline.output, self.config.log_excerpt_lines);
                Run::transition(
                    &self.db,
                    &run.id,
                    RunStatus::Building,
                    RunEvent::BaselineFailed,
                    RunPatch {
                        error: Some("baseline checks failed before any agent work".to_string()),
                        last_test_output: Some(excerpt),
                        ..Default::default()
                    },
                )
                .await?;
                return Ok(());
            }
            Run::mark_baseline_passed(&self.db, &run.id).await?;
        }

        let work_order = WorkOrder::require(&self.db, &run.work_order_id).await?;
        let provider = self.collaborators.providers.resolve(Some(&run.provider))?;
        let request = AgentRequest {
            run_id: run.id.clone(),
            role: AgentRole::Builder,
            prompt: builder_prompt(&work_order, run),
            workdir: worktree.path.clone(),
        };
        let header = format!("=== builder iteration {} ===", run.iteration);
        let pass = self.run_agent(run, provider.as_ref(), request, &header, stop).await?;

        if pass.stopped {
            return Ok(());
        }

        if let Some(payload) = pass.escalation {
            let run = Run::transition(
                &self.db,
                &run.id,
                RunStatus::Building,
                RunEvent::EscalationRaised,
                RunPatch {
                    escalation: Some(payload.clone()),
                    last_log_excerpt: Some(pass.excerpt),
                    clear_pid: true,
                    ..Default::default()
                },
            )
            .await?;
            let summary = format!("Run {} needs input: {}", run.id, payload.what_i_need);
            if let Err(e) = self
                .router
                .mirror_run_escalation(&run.project_id, &run.id, &summary, serde_json::to_value(&payload)?)
                .await
            {
                warn!(run_id = %run.id, "Failed to mirror run escalation: {}", e);
            }
            return Ok(());
        }

        let exit_ok = pass.exit.map(|e| e.success).unwrap_or(false);
        if pass.done || exit_ok {
            Run::transition(
                &self.db,
                &run.id,
                RunStatus::Building,
                RunEvent::BuildCompleted,
                RunPatch {
                    last_log_excerpt: Some(pass.excerpt),
                    clear_pid: true,
                    ..Default::default()
                },
            )
            .await?;
        } else {
            let code = pass.exit.and_then(|e| e.code);
            let failed = Run::transition(
                &self.db,
                &run.id,
                RunStatus::Building,
                RunEvent::OperationalFailure,
                RunPatch {
                    last_log_excerpt: Some(pass.excerpt),
                    ..RunPatch::failure(
                        failure_reason::AGENT_CRASHED,
                        format!("builder exited with code {:?} before signalling completion", code),
                    )
                },
            )
            .await?;
            self.release_worktree(&failed).await;
        }
        Ok(())
    }

    async fn test_phase(&self, run: &Run) -> Result<()> {
        let worktree = Self::require_worktree(run)?;
        let outcome = self
            .collaborators
            .checks
            .run(CheckKind::Tests, &worktree.path)
            .await?;
        let excerpt = tail_lines(&outcome.output, self.config.log_excerpt_lines);

        if outcome.passed {
            Run::transition(
                &self.db,
                &run.id,
                RunStatus::Testing,
                RunEvent::TestsPassed,
                RunPatch {
                    last_test_output: Some(excerpt),
                    ..Default::default()
                },
            )
            .await?;
            return Ok(());
        }

        if run.test_failures + 1 >= i64::from(self.config.max_iterations) {
            let failed = Run::transition(
                &self.db,
                &run.id,
                RunStatus::Testing,
                RunEvent::IterationLimit,
                RunPatch {
                    bump_test_failures: true,
                    last_test_output: Some(excerpt),
                    ..RunPatch::failure(
                        failure_reason::ITERATION_LIMIT,
                        format!(
                            "tests still failing after {} builder passes",
                            run.test_failures + 1
                        ),
                    )
                },
            )
            .await?;
            self.release_worktree(&failed).await;
        } else {
            Run::transition(
                &self.db,
                &run.id,
                RunStatus::Testing,
                RunEvent::TestsFailed,
                RunPatch {
                    bump_test_failures: true,
                    last_test_output: Some(excerpt),
                    ..Default::default()
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn review_phase(&self, run: &Run, stop: &mut watch::Receiver<bool>) -> Result<()> {
        let worktree = Self::require_worktree(run)?;
        let work_order = WorkOrder::require(&self.db, &run.work_order_id).await?;
        let provider = self.collaborators.providers.resolve(Some(&run.provider))?;
        let request = AgentRequest {
            run_id: run.id.clone(),
            role: AgentRole::Reviewer,
            prompt: reviewer_prompt(&work_order, run),
            workdir: worktree.path.clone(),
        };
        let header = format!("=== reviewer pass for iteration {} ===", run.iteration);
        let pass = self.run_agent(run, provider.as_ref(), request, &header, stop).await?;

        if pass.stopped {
            return Ok(());
        }
        if pass.escalation.is_some() {
            warn!(run_id = %run.id, "Ignoring escalation marker from reviewer");
        }

        let exit_ok = pass.exit.map(|e| e.success).unwrap_or(false);
        let (verdict, notes) = match pass.verdict {
            Some(verdict) => verdict,
            None if exit_ok => (
                ReviewerVerdict::ChangesRequested,
                Some("reviewer finished without a verdict".to_string()),
            ),
            None => {
                let failed = Run::transition(
                    &self.db,
                    &run.id,
                    RunStatus::AiReview,
                    RunEvent::OperationalFailure,
                    RunPatch {
                        last_log_excerpt: Some(pass.excerpt),
                        ..RunPatch::failure(
                            failure_reason::AGENT_CRASHED,
                            "reviewer exited without a verdict",
                        )
                    },
                )
                .await?;
                self.release_worktree(&failed).await;
                return Ok(());
            }
        };
        info!(run_id = %run.id, verdict = ?verdict, "Reviewer verdict");

        match verdict {
            ReviewerVerdict::Approved if self.config.auto_merge => {
                let patch = RunPatch {
                    reviewer_verdict: Some(verdict),
                    reviewer_notes: notes,
                    last_log_excerpt: Some(pass.excerpt),
                    clear_pid: true,
                    ..Default::default()
                };
                match self.merge(run, RunStatus::AiReview, patch.clone()).await {
                    Ok(_) => {}
                    Err(e @ AppError::Collaborator { .. }) => {
                        // The work is approved; leave the merge to a human retry.
                        warn!(run_id = %run.id, "Automatic merge failed, handing to review: {}", e);
                        Run::transition(
                            &self.db,
                            &run.id,
                            RunStatus::AiReview,
                            RunEvent::ReviewApproved,
                            RunPatch {
                                merge_status: Some("error".to_string()),
                                error: Some(e.to_string()),
                                ..patch
                            },
                        )
                        .await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            ReviewerVerdict::Approved => {
                Run::transition(
                    &self.db,
                    &run.id,
                    RunStatus::AiReview,
                    RunEvent::ReviewApproved,
                    RunPatch {
                        reviewer_verdict: Some(verdict),
                        reviewer_notes: notes,
                        last_log_excerpt: Some(pass.excerpt),
                        clear_pid: true,
                        ..Default::default()
                    },
                )
                .await?;
            }
            ReviewerVerdict::ChangesRequested
                if run.iteration >= i64::from(self.config.max_iterations) =>
            {
                let failed = Run::transition(
                    &self.db,
                    &run.id,
                    RunStatus::AiReview,
                    RunEvent::IterationLimit,
                    RunPatch {
                        reviewer_verdict: Some(verdict),
                        reviewer_notes: notes,
                        last_log_excerpt: Some(pass.excerpt),
                        ..RunPatch::failure(
                            failure_reason::ITERATION_LIMIT,
                            format!(
                                "reviewer still requested changes after {} iterations",
                                run.iteration
                            ),
                        )
                    },
                )
                .await?;
                self.release_worktree(&failed).await;
            }
            ReviewerVerdict::ChangesRequested => {
                Run::transition(
                    &self.db,
                    &run.id,
                    RunStatus::AiReview,
                    RunEvent::ChangesRequested,
                    RunPatch {
                        bump_iteration: true,
                        reviewer_verdict: Some(verdict),
                        reviewer_notes: notes,
                        last_log_excerpt: Some(pass.excerpt),
                        clear_pid: true,
                        ..Default::default()
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Runs one agent pass to completion, streaming output into the run log.
    /// A builder escalation stops the process right away.
    async fn run_agent(
        &self,
        run: &Run,
        provider: &dyn AgentProvider,
        request: AgentRequest,
        header: &str,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<PassOutput> {
        let role = request.role;
        let mut log = RunLog::open(&run.log_path, self.config.log_excerpt_lines).await;
        log.append(header).await;

        let mut session: Box<dyn AgentSession> = provider.start(request).await?;
        Run::record_pid(&self.db, &run.id, session.pid()).await?;

        let mut pass = PassOutput::default();
        loop {
            tokio::select! {
                line = session.next_line() => {
                    let Some(line) = line else { break };
                    log.append(&line).await;
                    for signal in provider.parse_output(&line) {
                        match signal {
                            OutputSignal::Escalation(payload) => {
                                if pass.escalation.is_none() {
                                    pass.escalation = Some(payload);
                                }
                            }
                            OutputSignal::Done(_) => pass.done = true,
                            OutputSignal::Verdict(v) => pass.verdict = Some((v.verdict, v.notes)),
                            OutputSignal::Cost(usd) => pass.cost_usd += usd,
                        }
                    }
                    if role == AgentRole::Builder && pass.escalation.is_some() {
                        info!(run_id = %run.id, "Builder raised an escalation, pausing run");
                        session.kill().await?;
                        break;
                    }
                }
                _ = stop.changed() => {
                    info!(run_id = %run.id, "Stopping agent on request");
                    session.kill().await?;
                    pass.stopped = true;
                    break;
                }
            }
        }

        let exit = session.wait().await?;
        info!(
            run_id = %run.id,
            role = %role,
            success = exit.success,
            code = ?exit.code,
            "Agent process exited"
        );
        pass.exit = Some(exit);

        if pass.cost_usd > 0.0 {
            if let Err(e) = self
                .budget
                .record_run_spend(&run.project_id, &run.id, pass.cost_usd)
                .await
            {
                warn!(run_id = %run.id, "Failed to record spend: {}", e);
            }
        }

        pass.excerpt = log.excerpt();
        Run::record_log_excerpt(&self.db, &run.id, &pass.excerpt).await?;
        Ok(pass)
    }

    /// Attempts the merge from `from` (`ai_review` or `you_review`).
    async fn merge(&self, run: &Run, from: RunStatus, patch: RunPatch) -> Result<Run> {
        let worktree = Self::require_worktree(run)?;
        let spec = self.worktree_spec(run).await?;

        info!(run_id = %run.id, branch = %worktree.branch, base = %spec.base_branch, "Attempting merge");
        match self.collaborators.vcs.merge(&spec, &worktree).await? {
            MergeOutcome::Merged => {
                let merged = Run::transition(
                    &self.db,
                    &run.id,
                    from,
                    RunEvent::MergeSucceeded,
                    RunPatch {
                        merge_status: Some("merged".to_string()),
                        ..patch
                    },
                )
                .await?;
                self.release_worktree(&merged).await;
                Ok(merged)
            }
            MergeOutcome::Conflict { files } => {
                warn!(run_id = %run.id, files = ?files, "Merge conflict, worktree preserved");
                Run::transition(
                    &self.db,
                    &run.id,
                    from,
                    RunEvent::MergeConflicted,
                    RunPatch {
                        merge_status: Some("conflict".to_string()),
                        error: Some(format!("merge conflict in: {}", files.join(", "))),
                        ..patch
                    },
                )
                .await
            }
        }
    }

    /// Human approval in `you_review`. A failed merge attempt leaves the run
    /// in `you_review` so approval can be retried.
    pub async fn approve(&self, run_id: &str) -> Result<Run> {
        let run = Run::require(&self.db, run_id).await?;
        if run.status != RunStatus::YouReview {
            return Err(AppError::invalid_transition(
                run.status,
                RunEvent::MergeSucceeded,
            ));
        }
        self.merge(&run, RunStatus::YouReview, RunPatch::default())
            .await
    }

    /// Resumes a run paused on an escalation. The keys must match the
    /// pending escalation exactly; a second call after the resume landed is
    /// rejected.
    pub async fn provide_input(&self, run_id: &str, inputs: Map<String, Value>) -> Result<Run> {
        let run = Run::require(&self.db, run_id).await?;
        if run.status != RunStatus::WaitingForInput {
            return Err(AppError::invalid_transition(
                run.status,
                RunEvent::InputProvided,
            ));
        }
        let payload = run.escalation_payload().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "run '{}' is waiting for input without an escalation",
                run_id
            ))
        })?;
        payload.check_inputs(&inputs)?;

        let resumed = Run::transition(
            &self.db,
            run_id,
            RunStatus::WaitingForInput,
            RunEvent::InputProvided,
            RunPatch {
                provided_inputs: Some(inputs),
                ..Default::default()
            },
        )
        .await?;

        if let Err(e) = self.router.resolve_run_mirrors(run_id, "input provided").await {
            warn!(run_id = %run_id, "Failed to resolve escalation mirrors: {}", e);
        }
        self.spawn_drive(run_id);
        Ok(resumed)
    }

    /// Applies `event` from whatever status the run is in now, re-reading on
    /// a lost race. Returns the run as it was and as it is now.
    async fn force(&self, run_id: &str, event: RunEvent, patch: RunPatch) -> Result<(Run, Run)> {
        const ATTEMPTS: usize = 3;
        let mut last_err = None;
        for _ in 0..ATTEMPTS {
            let before = Run::require(&self.db, run_id).await?;
            if before.status.apply(event).is_none() {
                return Err(AppError::invalid_transition(before.status, event));
            }
            match Run::transition(&self.db, run_id, before.status, event, patch.clone()).await {
                Ok(after) => return Ok((before, after)),
                Err(e @ AppError::StaleTransition { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::invalid_transition("unknown", event)))
    }

    /// Signals this instance's driver, or terminates a recorded pid that no
    /// local driver owns.
    fn stop_process(&self, run: &Run, pid: Option<i64>) {
        if self.drivers.stop(&run.id) {
            return;
        }
        if let Some(pid) = pid.and_then(|p| u32::try_from(p).ok()) {
            self.collaborators.probe.terminate(pid);
        }
    }

    /// Valid from any non-terminal status, including `you_review`.
    pub async fn cancel(&self, run_id: &str) -> Result<Run> {
        let (before, canceled) = self
            .force(run_id, RunEvent::Cancel, RunPatch::default())
            .await?;
        self.stop_process(&canceled, before.pid);
        info!(run_id = %run_id, "Run canceled");
        if let Err(e) = self.router.resolve_run_mirrors(run_id, "run canceled").await {
            warn!(run_id = %run_id, "Failed to resolve escalation mirrors: {}", e);
        }
        self.release_worktree(&canceled).await;
        Ok(canceled)
    }

    /// External safety signal. The run parks in `security_hold` until a
    /// human verdict.
    pub async fn flag_security(&self, run_id: &str, reason: &str) -> Result<Run> {
        let (before, held) = self
            .force(
                run_id,
                RunEvent::SecurityFlagged,
                RunPatch {
                    security_reason: Some(reason.to_string()),
                    clear_pid: true,
                    ..Default::default()
                },
            )
            .await?;
        self.stop_process(&held, before.pid);
        warn!(run_id = %run_id, reason = %reason, "Run placed on security hold");
        Ok(held)
    }

    pub async fn resolve_security_hold(
        &self,
        run_id: &str,
        verdict: SecurityVerdict,
        notes: Option<String>,
    ) -> Result<Run> {
        match verdict {
            SecurityVerdict::Clear => {
                Run::transition(
                    &self.db,
                    run_id,
                    RunStatus::SecurityHold,
                    RunEvent::SecurityCleared,
                    RunPatch {
                        reviewer_notes: notes,
                        ..Default::default()
                    },
                )
                .await
            }
            SecurityVerdict::Reject => {
                let failed = Run::transition(
                    &self.db,
                    run_id,
                    RunStatus::SecurityHold,
                    RunEvent::SecurityRejected,
                    RunPatch::failure(
                        failure_reason::SECURITY_REJECTED,
                        notes.unwrap_or_else(|| "rejected after security review".to_string()),
                    ),
                )
                .await?;
                self.release_worktree(&failed).await;
                Ok(failed)
            }
        }
    }

    /// Manual conflict resolution (`merged` from `merge_conflict`), a cancel,
    /// or plain annotations.
    pub async fn patch(&self, run_id: &str, req: PatchRunRequest) -> Result<Run> {
        match req.status {
            Some(RunStatus::Merged) => {
                let run = Run::require(&self.db, run_id).await?;
                if run.status != RunStatus::MergeConflict {
                    return Err(AppError::invalid_transition(
                        run.status,
                        RunEvent::ConflictResolved,
                    ));
                }
                let merged = Run::transition(
                    &self.db,
                    run_id,
                    RunStatus::MergeConflict,
                    RunEvent::ConflictResolved,
                    RunPatch {
                        merge_status: Some(
                            req.merge_status
                                .unwrap_or_else(|| "resolved_manually".to_string()),
                        ),
                        error: req.error,
                        ..Default::default()
                    },
                )
                .await?;
                self.release_worktree(&merged).await;
                Ok(merged)
            }
            Some(RunStatus::Canceled) => {
                let canceled = self.cancel(run_id).await?;
                if req.merge_status.is_some() || req.error.is_some() {
                    return Run::annotate(
                        &self.db,
                        run_id,
                        req.merge_status.as_deref(),
                        req.error.as_deref(),
                    )
                    .await;
                }
                Ok(canceled)
            }
            Some(status) => {
                let run = Run::require(&self.db, run_id).await?;
                Err(AppError::invalid_transition(
                    run.status,
                    format!("patch to {}", status),
                ))
            }
            None => {
                Run::annotate(
                    &self.db,
                    run_id,
                    req.merge_status.as_deref(),
                    req.error.as_deref(),
                )
                .await
            }
        }
    }

    /// Fails supervised runs that nothing is driving any more.
    pub async fn reconcile_orphans(&self) -> Result<Vec<Run>> {
        let candidates = Run::list_in_statuses(&self.db, &RunStatus::SUPERVISED).await?;
        let mut orphaned = Vec::new();

        for run in candidates {
            if self.is_driving(&run.id) {
                continue;
            }
            let pid = run.pid.and_then(|p| u32::try_from(p).ok());
            if let Some(pid) = pid {
                if self.collaborators.probe.is_alive(pid) {
                    debug!(run_id = %run.id, pid, "Supervised run still has a live process");
                    continue;
                }
            }

            let message = match pid {
                Some(pid) => format!("agent process {} is gone", pid),
                None => "no live driver or agent process".to_string(),
            };
            match Run::transition(
                &self.db,
                &run.id,
                run.status,
                RunEvent::Orphaned,
                RunPatch::failure(failure_reason::ORPHANED, message),
            )
            .await
            {
                Ok(failed) => {
                    warn!(run_id = %failed.id, "Marked orphaned run as failed");
                    self.release_worktree(&failed).await;
                    orphaned.push(failed);
                }
                Err(AppError::StaleTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(orphaned)
    }

    /// Picks up runs that were queued but never started, e.g. before a
    /// restart.
    pub async fn resume_queued(&self) -> Result<usize> {
        let queued = Run::list_in_statuses(&self.db, &[RunStatus::Queued]).await?;
        let mut resumed = 0;
        for run in queued {
            if !self.is_driving(&run.id) {
                self.spawn_drive(&run.id);
                resumed += 1;
            }
        }
        Ok(resumed)
    }
}
