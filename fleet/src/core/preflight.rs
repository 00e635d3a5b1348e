//! Pure preflight verdicts over a snapshot of repository facts.
//!
//! The io layer gathers a [`RepoSnapshot`]; [`check`] decides. A rejected
//! repository is skipped, never failed.

use serde::{Deserialize, Serialize};

use crate::core::types::{PushPolicy, ReasonCode};

/// Facts about a repository's git state needed to judge safety.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub merge_in_progress: bool,
    pub rebase_in_progress: bool,
    pub cherry_pick_in_progress: bool,
    /// Current branch, or `None` when HEAD is detached.
    pub branch: Option<String>,
    /// Tracking ref (e.g. `origin/main`), if configured.
    pub upstream: Option<String>,
    /// Commits on the local branch not on upstream.
    pub ahead: usize,
    /// Commits on upstream not on the local branch.
    pub behind: usize,
    pub conflicted: usize,
    pub untracked: usize,
}

/// Policy knobs for the preflight check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreflightPolicy {
    pub push: PushPolicy,
    pub max_untracked: usize,
}

/// Result of a preflight check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Safe,
    Unsafe {
        reason: ReasonCode,
        detail: String,
        remediation: Option<&'static str>,
    },
}

impl Verdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, Verdict::Safe)
    }

    fn unsafe_because(reason: ReasonCode, detail: String) -> Self {
        Verdict::Unsafe {
            reason,
            detail,
            remediation: reason.remediation(),
        }
    }
}

/// Decide whether an agent may touch a repository in the given state.
///
/// Checks run in a fixed order so the reported reason is deterministic:
/// in-flight operations, conflicts, detached HEAD, upstream, divergence,
/// untracked flood.
pub fn check(snapshot: &RepoSnapshot, policy: &PreflightPolicy) -> Verdict {
    if snapshot.merge_in_progress {
        return Verdict::unsafe_because(ReasonCode::MergeInProgress, "merge in progress".into());
    }
    if snapshot.rebase_in_progress {
        return Verdict::unsafe_because(ReasonCode::RebaseInProgress, "rebase in progress".into());
    }
    if snapshot.cherry_pick_in_progress {
        return Verdict::unsafe_because(
            ReasonCode::CherryPickInProgress,
            "cherry-pick in progress".into(),
        );
    }
    if snapshot.conflicted > 0 {
        return Verdict::unsafe_because(
            ReasonCode::UnresolvedConflicts,
            format!("{} conflicted path(s)", snapshot.conflicted),
        );
    }
    if snapshot.branch.is_none() {
        return Verdict::unsafe_because(ReasonCode::DetachedHead, "HEAD is detached".into());
    }
    match &snapshot.upstream {
        None if policy.push != PushPolicy::None => {
            return Verdict::unsafe_because(
                ReasonCode::NoUpstream,
                "no upstream tracking branch".into(),
            );
        }
        Some(upstream) if snapshot.ahead > 0 && snapshot.behind > 0 => {
            return Verdict::unsafe_because(
                ReasonCode::Diverged,
                format!(
                    "diverged from {upstream} (ahead {}, behind {})",
                    snapshot.ahead, snapshot.behind
                ),
            );
        }
        _ => {}
    }
    if snapshot.untracked > policy.max_untracked {
        return Verdict::unsafe_because(
            ReasonCode::TooManyUntracked,
            format!(
                "{} untracked files (limit {})",
                snapshot.untracked, policy.max_untracked
            ),
        );
    }
    Verdict::Safe
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean() -> RepoSnapshot {
        RepoSnapshot {
            branch: Some("main".to_string()),
            upstream: Some("origin/main".to_string()),
            ..RepoSnapshot::default()
        }
    }

    fn policy(push: PushPolicy) -> PreflightPolicy {
        PreflightPolicy {
            push,
            max_untracked: 10,
        }
    }

    fn reason(verdict: Verdict) -> ReasonCode {
        match verdict {
            Verdict::Unsafe { reason, .. } => reason,
            Verdict::Safe => panic!("expected unsafe verdict"),
        }
    }

    #[test]
    fn clean_repo_is_safe() {
        assert!(check(&clean(), &policy(PushPolicy::Upstream)).is_safe());
    }

    #[test]
    fn merge_in_progress_wins_over_later_checks() {
        let snapshot = RepoSnapshot {
            merge_in_progress: true,
            branch: None,
            untracked: 1000,
            ..clean()
        };
        assert_eq!(
            reason(check(&snapshot, &policy(PushPolicy::Upstream))),
            ReasonCode::MergeInProgress
        );
    }

    #[test]
    fn detached_head_is_rejected_with_remediation() {
        let snapshot = RepoSnapshot {
            branch: None,
            ..clean()
        };
        match check(&snapshot, &policy(PushPolicy::None)) {
            Verdict::Unsafe {
                reason,
                remediation,
                ..
            } => {
                assert_eq!(reason, ReasonCode::DetachedHead);
                assert!(remediation.expect("remediation").contains("git switch"));
            }
            Verdict::Safe => panic!("expected unsafe"),
        }
    }

    #[test]
    fn missing_upstream_only_matters_when_pushing() {
        let snapshot = RepoSnapshot {
            upstream: None,
            ..clean()
        };
        assert!(check(&snapshot, &policy(PushPolicy::None)).is_safe());
        assert_eq!(
            reason(check(&snapshot, &policy(PushPolicy::Upstream))),
            ReasonCode::NoUpstream
        );
    }

    #[test]
    fn diverged_requires_both_ahead_and_behind() {
        let ahead_only = RepoSnapshot {
            ahead: 2,
            ..clean()
        };
        assert!(check(&ahead_only, &policy(PushPolicy::Upstream)).is_safe());

        let diverged = RepoSnapshot {
            ahead: 2,
            behind: 1,
            ..clean()
        };
        assert_eq!(
            reason(check(&diverged, &policy(PushPolicy::Upstream))),
            ReasonCode::Diverged
        );
    }

    #[test]
    fn conflicts_and_untracked_flood_are_rejected() {
        let conflicted = RepoSnapshot {
            conflicted: 1,
            ..clean()
        };
        assert_eq!(
            reason(check(&conflicted, &policy(PushPolicy::None))),
            ReasonCode::UnresolvedConflicts
        );

        let flooded = RepoSnapshot {
            untracked: 11,
            ..clean()
        };
        assert_eq!(
            reason(check(&flooded, &policy(PushPolicy::None))),
            ReasonCode::TooManyUntracked
        );
        let at_limit = RepoSnapshot {
            untracked: 10,
            ..clean()
        };
        assert!(check(&at_limit, &policy(PushPolicy::None)).is_safe());
    }
}
