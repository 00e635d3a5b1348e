//! Drives one repository through Planning → Validating → Executing.
//!
//! Per-repository failures become a [`RepoOutcome`]; only failures of shared
//! state (the phase callback) escape as errors and abort the run.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::pipeline::{PipelineState, StateMachine};
use crate::core::plan::{AgentPlan, Extraction, PlanAction, extract_plan_block, parse_block};
use crate::core::preflight::Verdict;
use crate::core::types::{
    ExecMode, PushPolicy, ReasonCode, RepoOutcome, RepoStatus, TaskKind, WorkItem,
};
use crate::error::{DriverError, FleetError};
use crate::governor::Governor;
use crate::guardrails::Guardrails;
use crate::io::atomic::{read_json, remove_if_exists, write_json};
use crate::io::audit::{AuditLog, OutcomeRecord};
use crate::io::config::FleetConfig;
use crate::io::git::Git;
use crate::io::lock::{Lease, LeaseConfig};
use crate::io::prompt::{PromptInputs, render_plan_prompt};
use crate::io::session::{AgentErrorKind, SessionDriver, SessionGuard, WaitCondition, WaitOutcome};
use crate::io::signals::Interrupt;
use crate::preflight;

/// Name of the per-repository lease inside the git directory.
pub const REPO_LEASE: &str = "fleet.lock";

/// Plan persisted by `plan` mode for a later `apply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPlan {
    pub run_id: String,
    pub repo: String,
    pub task: TaskKind,
    pub plan: Value,
    /// Repository fingerprint when the plan was created.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

pub fn saved_plan_path(state_dir: &Path, slug: &str) -> PathBuf {
    state_dir.join("plans").join(format!("{slug}.json"))
}

/// Everything a pipeline run borrows from the enclosing run.
pub struct PipelineContext<'a> {
    pub config: &'a FleetConfig,
    pub state_dir: &'a Path,
    pub run_id: &'a str,
    pub driver: &'a dyn SessionDriver,
    pub guardrails: &'a Guardrails,
    pub governor: &'a Governor,
    pub interrupt: &'a Interrupt,
}

enum Stop {
    /// Ends this repository only.
    Repo(anyhow::Error),
    /// Shared state is broken; ends the run.
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for Stop {
    fn from(err: anyhow::Error) -> Self {
        Stop::Repo(err)
    }
}

impl From<FleetError> for Stop {
    fn from(err: FleetError) -> Self {
        Stop::Repo(err.into())
    }
}

impl From<DriverError> for Stop {
    fn from(err: DriverError) -> Self {
        Stop::Repo(FleetError::Session(err).into())
    }
}

type Phase<'f> = &'f mut dyn FnMut(PipelineState) -> anyhow::Result<()>;

struct Run<'a, 'f> {
    ctx: &'a PipelineContext<'a>,
    item: &'a WorkItem,
    git: Git,
    audit: AuditLog,
    machine: StateMachine,
    on_phase: Phase<'f>,
}

/// Process one work item end to end.
///
/// `on_phase` is called after every state change, before the work of that
/// state begins; an error from it is fatal to the run.
#[instrument(skip_all, fields(repo = %item.target.id, mode = item.mode.as_str()))]
pub fn process_item(
    ctx: &PipelineContext<'_>,
    item: &WorkItem,
    on_phase: Phase<'_>,
) -> anyhow::Result<RepoOutcome> {
    let started = Instant::now();
    let mut run = Run {
        ctx,
        item,
        git: Git::new(&item.target.path).with_timeout(ctx.config.timeouts.git()),
        audit: AuditLog::new(ctx.state_dir, ctx.run_id, &item.target.slug()),
        machine: StateMachine::default(),
        on_phase,
    };

    let result = run.execute();
    let outcome = match result {
        Ok(summary) => RepoOutcome::completed(&item.target.id, Some(summary), started.elapsed()),
        Err(Stop::Fatal(err)) => return Err(err),
        Err(Stop::Repo(err)) => run.classify(&err, started.elapsed()),
    };
    let terminal = match outcome.status {
        RepoStatus::Completed => PipelineState::Completed,
        RepoStatus::Interrupted => PipelineState::Interrupted,
        RepoStatus::Failed | RepoStatus::Skipped => PipelineState::Failed,
    };
    if !run.machine.state().is_terminal() && run.machine.advance(terminal).is_ok() {
        (run.on_phase)(terminal)?;
    }
    if let Err(err) = run
        .audit
        .write_outcome(&OutcomeRecord::new(&outcome, run.machine.history()))
    {
        warn!(err = %err, "failed to write audit outcome");
    }
    Ok(outcome)
}

impl Run<'_, '_> {
    fn enter(&mut self, to: PipelineState) -> Result<(), Stop> {
        self.machine.advance(to).map_err(FleetError::IllegalTransition)?;
        (self.on_phase)(to).map_err(Stop::Fatal)?;
        debug!(state = to.as_str(), "pipeline state");
        Ok(())
    }

    fn execute(&mut self) -> Result<String, Stop> {
        let item = self.item;
        let target = &item.target;
        let config = self.ctx.config;

        let inspection = preflight::inspect(target, config)?;
        if !inspection.verdict.is_safe() {
            return Err(self.skip(inspection.verdict));
        }
        let branch = inspection
            .snapshot
            .and_then(|s| s.branch)
            .ok_or_else(|| anyhow!("HEAD is detached"))?;
        let lease_path = self.git.git_path(REPO_LEASE)?;
        let _lease = Lease::acquire(&lease_path, &LeaseConfig::fail_fast(), self.ctx.interrupt)
            .map_err(|err| match FleetError::find(&err) {
                Some(FleetError::LockTimeout { owner_pid, .. }) => repo_failed(
                    ReasonCode::RepoLocked,
                    format!("repository held by another run (pid {owner_pid:?})"),
                ),
                _ => Stop::Repo(err),
            })?;

        let (raw, fingerprint) = match self.item.mode {
            ExecMode::Plan | ExecMode::Full => self.plan_with_agent(&branch)?,
            ExecMode::Apply => self.load_saved_plan()?,
        };

        let plan = self.validate(&raw, &fingerprint)?;

        if self.item.mode == ExecMode::Plan {
            let path = self.save_plan(&plan, &fingerprint)?;
            self.enter(PipelineState::Completed)?;
            return Ok(format!("plan saved to {}", path.display()));
        }

        self.enter(PipelineState::Executing)?;
        let summary = self.apply(&plan, &branch)?;
        if self.item.mode == ExecMode::Apply {
            let path = saved_plan_path(self.ctx.state_dir, &target.slug());
            if let Err(err) = remove_if_exists(&path) {
                warn!(err = %err, "failed to remove applied plan");
            }
        }
        self.enter(PipelineState::Completed)?;
        Ok(summary)
    }

    fn skip(&self, verdict: Verdict) -> Stop {
        match verdict {
            Verdict::Safe => Stop::Repo(anyhow!("preflight verdict lost")),
            Verdict::Unsafe { reason, detail, .. } => {
                info!(reason = %reason, detail, "preflight skipped repository");
                Stop::Repo(
                    anyhow::Error::from(FleetError::PreflightSkipped {
                        repo: self.item.target.id.clone(),
                        reason,
                    })
                    .context(detail),
                )
            }
        }
    }

    /// Planning phase: one agent session, one instruction, one plan block.
    fn plan_with_agent(&mut self, branch: &str) -> Result<(Value, String), Stop> {
        self.enter(PipelineState::Planning)?;
        let config = self.ctx.config;
        let item = self.item;
        let target = &item.target;

        let changes = self
            .git
            .status_porcelain()?
            .into_iter()
            .map(|e| format!("{} {}", e.code, e.path))
            .collect();
        let latest_tag = match self.item.task {
            TaskKind::Release => self.git.latest_tag()?,
            TaskKind::Commit | TaskKind::Upgrade => None,
        };
        let mut prompt_target = target.clone();
        prompt_target.branch = Some(branch.to_string());
        let prompt = render_plan_prompt(&PromptInputs {
            task: self.item.task,
            target: &prompt_target,
            changes,
            latest_tag,
        })?;

        let driver = self.ctx.driver;
        let session = driver.spawn(&target.path, config.timeouts.spawn())?;
        let mut guard = SessionGuard::new(driver, session);
        info!(session = %guard.session().id, backend = driver.name(), "agent session started");
        driver.send(guard.session_mut(), &prompt)?;

        let condition = WaitCondition::Idle {
            quiet: Duration::from_secs(config.agent.idle_quiet_secs),
        };
        let waited = driver.wait(
            guard.session_mut(),
            condition,
            config.timeouts.planning(),
            self.ctx.interrupt,
        )?;
        let transcript = match driver.transcript(guard.session()) {
            Ok(text) => text,
            Err(err) => {
                warn!(err = %err, "failed to capture transcript");
                String::new()
            }
        };
        if let Err(err) = self.audit.write_transcript(&transcript) {
            warn!(err = %err, "failed to write transcript");
        }
        guard.kill()?;

        match waited {
            WaitOutcome::Met => {}
            WaitOutcome::TimedOut => {
                return Err(FleetError::PhaseTimeout {
                    phase: "planning",
                    secs: config.timeouts.planning_secs,
                }
                .into());
            }
            WaitOutcome::Interrupted => return Err(FleetError::Interrupted.into()),
            WaitOutcome::AgentError(AgentErrorKind::RateLimited) => {
                self.ctx
                    .governor
                    .record_rate_limit(&format!("agent rate limited in {}", target.id))
                    .map_err(Stop::Fatal)?;
                return Err(repo_failed(
                    ReasonCode::RateLimited,
                    "agent reported a rate limit".into(),
                ));
            }
            WaitOutcome::AgentError(AgentErrorKind::Crashed) => {
                return Err(anyhow!("agent exited with a failure status").into());
            }
        }

        let block = match extract_plan_block(&transcript) {
            Extraction::Found(block) => block,
            Extraction::Missing => return Err(no_plan("agent output has no plan block")),
            Extraction::Ambiguous(n) => {
                return Err(no_plan(&format!("agent output has {n} differing plan blocks")));
            }
        };
        let raw = parse_block(&block).map_err(|err| no_plan(&format!("{err:#}")))?;
        if let Err(err) = self.audit.write_plan(&raw) {
            warn!(err = %err, "failed to write plan");
        }
        let fingerprint = self.git.fingerprint()?;
        self.enter(PipelineState::Planned)?;
        Ok((raw, fingerprint))
    }

    fn load_saved_plan(&mut self) -> Result<(Value, String), Stop> {
        let item = self.item;
        let target = &item.target;
        let path = saved_plan_path(self.ctx.state_dir, &target.slug());
        let saved: Option<SavedPlan> = read_json(&path)?;
        let saved = match saved {
            Some(saved) if saved.repo == target.id => saved,
            Some(saved) => {
                return Err(missing_plan(format!(
                    "{} belongs to {}",
                    path.display(),
                    saved.repo
                )));
            }
            None => return Err(missing_plan(format!("no saved plan at {}", path.display()))),
        };
        if saved.task != self.item.task {
            return Err(missing_plan(format!(
                "saved plan is for task {}, not {}",
                saved.task.as_str(),
                self.item.task.as_str()
            )));
        }
        if let Err(err) = self.audit.write_plan(&saved.plan) {
            warn!(err = %err, "failed to write plan");
        }
        self.enter(PipelineState::Planned)?;
        Ok((saved.plan, saved.fingerprint))
    }

    fn validate(&mut self, raw: &Value, fingerprint: &str) -> Result<AgentPlan, Stop> {
        self.enter(PipelineState::Validating)?;
        let started = Instant::now();
        let (result, plan) = self.ctx.guardrails.validate(raw, &self.git, fingerprint)?;
        if let Err(err) = self.audit.write_validation(&result) {
            warn!(err = %err, "failed to write validation result");
        }
        let limit = self.ctx.config.timeouts.validating();
        if started.elapsed() > limit {
            return Err(FleetError::PhaseTimeout {
                phase: "validating",
                secs: limit.as_secs(),
            }
            .into());
        }
        let Some(plan) = plan else {
            return Err(FleetError::ValidationFailed {
                reason: result.reason.unwrap_or(ReasonCode::SchemaInvalid),
                detail: result.detail.unwrap_or_default(),
            }
            .into());
        };
        self.enter(PipelineState::Validated)?;
        Ok(plan)
    }

    fn save_plan(&self, plan: &AgentPlan, fingerprint: &str) -> Result<PathBuf, Stop> {
        let item = self.item;
        let target = &item.target;
        let path = saved_plan_path(self.ctx.state_dir, &target.slug());
        let saved = SavedPlan {
            run_id: self.ctx.run_id.to_string(),
            repo: target.id.clone(),
            task: self.item.task,
            plan: serde_json::to_value(plan).context("serialize plan")?,
            fingerprint: fingerprint.to_string(),
            created_at: Utc::now(),
        };
        write_json(&path, &saved)?;
        info!(path = %path.display(), "validated plan saved");
        Ok(path)
    }

    /// Executing phase: the orchestrator performs the mutation itself.
    fn apply(&self, plan: &AgentPlan, branch: &str) -> Result<String, Stop> {
        let item = self.item;
        let target = &item.target;
        let push = target.overrides.push.unwrap_or(self.ctx.config.push);
        let git = self
            .git
            .clone()
            .with_timeout(self.ctx.config.timeouts.git().min(self.ctx.config.timeouts.executing()));

        match &plan.action {
            PlanAction::Commit { message, files } => {
                let record = git.commit_files(branch, message, files)?;
                let short = &record.new_oid[..record.new_oid.len().min(12)];
                if push == PushPolicy::Upstream {
                    let pushed = git
                        .push_target(branch, target.upstream.as_deref())
                        .and_then(|dest| git.push_branch(branch, &dest));
                    if let Err(err) = pushed {
                        if let Err(rollback) = git.rollback_commit(&record) {
                            warn!(err = %rollback, "rollback after failed push failed");
                        }
                        return Err(push_failed(&err));
                    }
                    info!(commit = short, "commit pushed");
                    return Ok(format!("commit {short} pushed"));
                }
                info!(commit = short, "commit created");
                Ok(format!("commit {short}"))
            }
            PlanAction::Release { tag, message } => {
                git.create_tag(tag, message)?;
                if push == PushPolicy::Upstream {
                    let pushed = git
                        .push_target(branch, target.upstream.as_deref())
                        .and_then(|dest| git.push_tag(&dest.remote, tag));
                    if let Err(err) = pushed {
                        if let Err(rollback) = git.delete_tag(tag) {
                            warn!(err = %rollback, "rollback after failed push failed");
                        }
                        return Err(push_failed(&err));
                    }
                    info!(tag, "tag pushed");
                    return Ok(format!("tag {tag} pushed"));
                }
                info!(tag, "tag created");
                Ok(format!("tag {tag}"))
            }
        }
    }

    /// Map a per-repository failure to an outcome.
    fn classify(&self, err: &anyhow::Error, duration: Duration) -> RepoOutcome {
        let repo = &self.item.target.id;
        let mut detail = format!("{err:#}");
        let (status, reason) = match FleetError::find(err) {
            Some(FleetError::PreflightSkipped { reason, .. }) => {
                detail = err.to_string();
                (RepoStatus::Skipped, *reason)
            }
            Some(FleetError::Interrupted) => (RepoStatus::Interrupted, ReasonCode::Interrupted),
            Some(typed) => (RepoStatus::Failed, typed.reason()),
            None => {
                let reason = match self.machine.state() {
                    PipelineState::Planning => ReasonCode::SessionError,
                    _ => ReasonCode::ExecutionFailed,
                };
                (RepoStatus::Failed, reason)
            }
        };
        match status {
            RepoStatus::Skipped | RepoStatus::Interrupted => {
                info!(status = status.as_str(), reason = %reason, detail, "repository not processed");
            }
            _ => warn!(reason = %reason, detail, "repository failed"),
        }
        RepoOutcome::with_reason(repo, status, reason, detail, duration)
    }
}

fn repo_failed(reason: ReasonCode, detail: String) -> Stop {
    FleetError::RepoFailed { reason, detail }.into()
}

fn no_plan(detail: &str) -> Stop {
    repo_failed(ReasonCode::NoPlanProduced, detail.to_string())
}

fn missing_plan(detail: String) -> Stop {
    repo_failed(ReasonCode::PlanMissing, detail)
}

fn push_failed(err: &anyhow::Error) -> Stop {
    repo_failed(
        ReasonCode::PushFailed,
        format!("{err:#}; local change rolled back"),
    )
}
