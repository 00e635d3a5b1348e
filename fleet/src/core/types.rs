//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between components and the persisted
//! formats (ledger, checkpoint, audit). They must not depend on external state.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What the agent is asked to produce for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Stage pending changes and write a commit message.
    Commit,
    /// Upgrade dependency manifests, then commit them.
    Upgrade,
    /// Propose an annotated release tag.
    Release,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Commit => "commit",
            TaskKind::Upgrade => "upgrade",
            TaskKind::Release => "release",
        }
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(TaskKind::Commit),
            "upgrade" => Ok(TaskKind::Upgrade),
            "release" => Ok(TaskKind::Release),
            other => Err(format!(
                "unknown task '{other}' (expected commit|upgrade|release)"
            )),
        }
    }
}

/// Which pipeline phases a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Plan and validate only; persist the validated plan.
    Plan,
    /// Re-validate and execute a previously persisted plan (no agent).
    Apply,
    /// Plan, validate and execute.
    Full,
}

impl ExecMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecMode::Plan => "plan",
            ExecMode::Apply => "apply",
            ExecMode::Full => "full",
        }
    }

    /// True when this mode needs an agent session.
    pub fn needs_agent(self) -> bool {
        !matches!(self, ExecMode::Apply)
    }
}

impl FromStr for ExecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(ExecMode::Plan),
            "apply" => Ok(ExecMode::Apply),
            "full" => Ok(ExecMode::Full),
            other => Err(format!("unknown mode '{other}' (expected plan|apply|full)")),
        }
    }
}

/// Whether the orchestrator pushes after a successful local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPolicy {
    None,
    Upstream,
}

impl FromStr for PushPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(PushPolicy::None),
            "upstream" => Ok(PushPolicy::Upstream),
            other => Err(format!("unknown push policy '{other}' (expected none|upstream)")),
        }
    }
}

/// Per-repository overrides layered on top of the run configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoOverrides {
    pub max_untracked: Option<usize>,
    pub push: Option<PushPolicy>,
}

/// One unit of work: a repository on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTarget {
    /// Canonical path rendered as a string; the stable repository identifier.
    pub id: String,
    pub path: PathBuf,
    /// Branch checked out when the target was enqueued (`None` when detached).
    pub branch: Option<String>,
    /// Upstream remote name; `None` means "use the branch's tracking remote".
    pub upstream: Option<String>,
    #[serde(default)]
    pub overrides: RepoOverrides,
}

impl RepoTarget {
    /// Filesystem-safe name for per-repository artifacts.
    pub fn slug(&self) -> String {
        repo_slug(&self.id)
    }
}

/// A repository target plus the task to run on it. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub target: RepoTarget,
    pub task: TaskKind,
    pub mode: ExecMode,
}

/// Terminal (or interrupted) status of one repository in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    Completed,
    Failed,
    /// Unsafe precondition; not an orchestrator error.
    Skipped,
    Interrupted,
}

impl RepoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RepoStatus::Completed => "completed",
            RepoStatus::Failed => "failed",
            RepoStatus::Skipped => "skipped",
            RepoStatus::Interrupted => "interrupted",
        }
    }

    /// Terminal outcomes are never re-run on resume.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RepoStatus::Interrupted)
    }
}

/// Stable, machine-readable reason codes surfaced in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    // Preflight.
    NotARepository,
    MergeInProgress,
    RebaseInProgress,
    CherryPickInProgress,
    DetachedHead,
    NoUpstream,
    Diverged,
    UnresolvedConflicts,
    TooManyUntracked,
    RepoLocked,
    // Session / phases.
    SessionError,
    PhaseTimeout,
    RateLimited,
    NoPlanProduced,
    PlanMissing,
    IllegalTransition,
    // Guardrails.
    SchemaInvalid,
    Denylist,
    SizeLimit,
    BinaryFile,
    NotARegularFile,
    SecretDetected,
    DriftDetected,
    // Execution.
    ExecutionFailed,
    PushFailed,
    // Run control.
    LockTimeout,
    Interrupted,
    InterruptedDuringExecute,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::NotARepository => "not_a_repository",
            ReasonCode::MergeInProgress => "merge_in_progress",
            ReasonCode::RebaseInProgress => "rebase_in_progress",
            ReasonCode::CherryPickInProgress => "cherry_pick_in_progress",
            ReasonCode::DetachedHead => "detached_head",
            ReasonCode::NoUpstream => "no_upstream",
            ReasonCode::Diverged => "diverged",
            ReasonCode::UnresolvedConflicts => "unresolved_conflicts",
            ReasonCode::TooManyUntracked => "too_many_untracked",
            ReasonCode::RepoLocked => "repo_locked",
            ReasonCode::SessionError => "session_error",
            ReasonCode::PhaseTimeout => "phase_timeout",
            ReasonCode::RateLimited => "rate_limited",
            ReasonCode::NoPlanProduced => "no_plan_produced",
            ReasonCode::PlanMissing => "plan_missing",
            ReasonCode::IllegalTransition => "illegal_transition",
            ReasonCode::SchemaInvalid => "schema_invalid",
            ReasonCode::Denylist => "denylist",
            ReasonCode::SizeLimit => "size_limit",
            ReasonCode::BinaryFile => "binary_file",
            ReasonCode::NotARegularFile => "not_a_regular_file",
            ReasonCode::SecretDetected => "secret_detected",
            ReasonCode::DriftDetected => "drift_detected",
            ReasonCode::ExecutionFailed => "execution_failed",
            ReasonCode::PushFailed => "push_failed",
            ReasonCode::LockTimeout => "lock_timeout",
            ReasonCode::Interrupted => "interrupted",
            ReasonCode::InterruptedDuringExecute => "interrupted_during_execute",
        }
    }

    /// Suggested operator command for unsafe preconditions.
    pub fn remediation(self) -> Option<&'static str> {
        let hint = match self {
            ReasonCode::NotARepository => "git init (or remove the path from the repo list)",
            ReasonCode::MergeInProgress => "git merge --abort  # or finish the merge and commit",
            ReasonCode::RebaseInProgress => "git rebase --abort  # or git rebase --continue",
            ReasonCode::CherryPickInProgress => "git cherry-pick --abort",
            ReasonCode::DetachedHead => "git switch <branch>",
            ReasonCode::NoUpstream => "git branch --set-upstream-to=<remote>/<branch>",
            ReasonCode::Diverged => "git pull --rebase  # reconcile local and upstream",
            ReasonCode::UnresolvedConflicts => "git status  # resolve conflicts, then git add",
            ReasonCode::TooManyUntracked => "review .gitignore  # untracked files exceed the limit",
            ReasonCode::RepoLocked => "wait for the other run, or remove <git-dir>/fleet.lock if stale",
            ReasonCode::InterruptedDuringExecute => {
                "git log -1 && git status  # verify the interrupted mutation by hand"
            }
            _ => return None,
        };
        Some(hint)
    }

    /// Reasons produced by the security guardrails.
    pub fn is_validation(self) -> bool {
        matches!(
            self,
            ReasonCode::SchemaInvalid
                | ReasonCode::Denylist
                | ReasonCode::SizeLimit
                | ReasonCode::BinaryFile
                | ReasonCode::NotARegularFile
                | ReasonCode::SecretDetected
                | ReasonCode::DriftDetected
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of processing one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOutcome {
    pub repo: String,
    pub status: RepoStatus,
    pub reason: Option<ReasonCode>,
    /// Human-readable detail (never secret values).
    pub detail: Option<String>,
    /// Resulting state on success (commit oid or tag name).
    pub result: Option<String>,
    pub duration: Duration,
}

impl RepoOutcome {
    pub fn completed(repo: &str, result: Option<String>, duration: Duration) -> Self {
        Self {
            repo: repo.to_string(),
            status: RepoStatus::Completed,
            reason: None,
            detail: None,
            result,
            duration,
        }
    }

    pub fn with_reason(
        repo: &str,
        status: RepoStatus,
        reason: ReasonCode,
        detail: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            repo: repo.to_string(),
            status,
            reason: Some(reason),
            detail: Some(detail.into()),
            result: None,
            duration,
        }
    }
}

/// Build a stable, filesystem-safe slug: sanitized basename plus a short hash of the id.
pub fn repo_slug(id: &str) -> String {
    let base = id
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("repo");
    let mut clean: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if clean.is_empty() || clean.chars().all(|c| c == '.') {
        clean = "repo".to_string();
    }
    let digest = Sha256::digest(id.as_bytes());
    format!("{clean}-{}", &hex::encode(digest)[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_stable_and_sanitized() {
        let a = repo_slug("/home/me/src/my repo");
        let b = repo_slug("/home/me/src/my repo");
        assert_eq!(a, b);
        assert!(a.starts_with("my_repo-"));
        assert_eq!(a.len(), "my_repo-".len() + 8);
    }

    #[test]
    fn slug_differs_for_same_basename_in_different_dirs() {
        assert_ne!(repo_slug("/a/app"), repo_slug("/b/app"));
    }

    #[test]
    fn reason_codes_serialize_snake_case() {
        let json = serde_json::to_string(&ReasonCode::MergeInProgress).expect("serialize");
        assert_eq!(json, "\"merge_in_progress\"");
        assert_eq!(ReasonCode::MergeInProgress.as_str(), "merge_in_progress");
    }

    #[test]
    fn parses_cli_enums() {
        assert_eq!("upgrade".parse::<TaskKind>(), Ok(TaskKind::Upgrade));
        assert_eq!("apply".parse::<ExecMode>(), Ok(ExecMode::Apply));
        assert_eq!("none".parse::<PushPolicy>(), Ok(PushPolicy::None));
        assert!("bogus".parse::<ExecMode>().is_err());
    }
}
