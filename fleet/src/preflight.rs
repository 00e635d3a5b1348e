//! Repository resolution, preflight inspection, and startup dependency probes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, instrument};

use crate::core::preflight::{self, PreflightPolicy, RepoSnapshot, Verdict};
use crate::core::types::{ExecMode, ReasonCode, RepoTarget};
use crate::error::FleetError;
use crate::io::config::FleetConfig;
use crate::io::git::Git;
use crate::io::process::find_executable;
use crate::io::session::SessionDriver;

/// Verdict plus the snapshot it was computed from (absent for non-repositories).
#[derive(Debug, Clone)]
pub struct Inspection {
    pub verdict: Verdict,
    pub snapshot: Option<RepoSnapshot>,
}

/// Build a target for `raw`, canonicalizing the path and applying `[[repo]]`
/// overrides.
///
/// Paths that do not exist keep their given spelling as the id; preflight
/// then reports them as `not_a_repository`.
pub fn resolve_target(raw: &Path, config: &FleetConfig) -> RepoTarget {
    let path = match fs::canonicalize(raw) {
        Ok(canonical) => {
            let git = Git::new(&canonical).with_timeout(config.timeouts.git());
            match git.is_repository().then(|| git.toplevel()) {
                Some(Ok(top)) => fs::canonicalize(&top).unwrap_or(top),
                _ => canonical,
            }
        }
        Err(_) => raw.to_path_buf(),
    };
    let (upstream, overrides) = config.overrides_for(&path);
    RepoTarget {
        id: path.display().to_string(),
        path,
        branch: None,
        upstream,
        overrides,
    }
}

pub fn policy_for(target: &RepoTarget, config: &FleetConfig) -> PreflightPolicy {
    PreflightPolicy {
        push: target.overrides.push.unwrap_or(config.push),
        max_untracked: target
            .overrides
            .max_untracked
            .unwrap_or(config.preflight.max_untracked),
    }
}

/// Inspect the repository and decide whether an agent may touch it.
#[instrument(skip_all, fields(repo = %target.id))]
pub fn inspect(target: &RepoTarget, config: &FleetConfig) -> Result<Inspection> {
    let git = Git::new(&target.path).with_timeout(config.timeouts.git());
    if !target.path.is_dir() || !git.is_repository() {
        return Ok(Inspection {
            verdict: Verdict::Unsafe {
                reason: ReasonCode::NotARepository,
                detail: format!("{} is not a git work tree", target.path.display()),
                remediation: ReasonCode::NotARepository.remediation(),
            },
            snapshot: None,
        });
    }
    let snapshot = git.snapshot()?;
    let verdict = preflight::check(&snapshot, &policy_for(target, config));
    debug!(safe = verdict.is_safe(), "preflight verdict");
    Ok(Inspection {
        verdict,
        snapshot: Some(snapshot),
    })
}

/// Preflight every path without engaging an agent.
pub fn inspect_all(paths: &[PathBuf], config: &FleetConfig) -> Vec<(RepoTarget, Result<Inspection>)> {
    let mut targets: Vec<RepoTarget> = paths.iter().map(|p| resolve_target(p, config)).collect();
    targets.sort_by(|a, b| a.id.cmp(&b.id));
    targets.dedup_by(|a, b| a.id == b.id);
    targets
        .into_iter()
        .map(|target| {
            let inspection = inspect(&target, config);
            (target, inspection)
        })
        .collect()
}

/// Probe external programs before any work starts.
///
/// `git` is always required; the session backend and agent command only
/// when the mode runs an agent.
pub fn check_dependencies(mode: ExecMode, driver: &dyn SessionDriver) -> Result<()> {
    if find_executable("git").is_none() {
        return Err(FleetError::DependencyMissing("git not found on PATH".into()).into());
    }
    if mode.needs_agent() {
        driver.check_available().map_err(|err| {
            FleetError::DependencyMissing(format!("{} backend: {}", driver.name(), err.message))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PushPolicy;
    use crate::io::config::RepoEntry;
    use crate::test_support::{ScriptedDriver, TestRepo};

    #[test]
    fn missing_path_is_not_a_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = FleetConfig::default();
        let target = resolve_target(&temp.path().join("nope"), &config);
        let inspection = inspect(&target, &config).expect("inspect");
        assert!(matches!(
            inspection.verdict,
            Verdict::Unsafe {
                reason: ReasonCode::NotARepository,
                ..
            }
        ));
        assert!(inspection.snapshot.is_none());
    }

    #[test]
    fn subdirectory_resolves_to_toplevel() {
        let repo = TestRepo::new().expect("repo");
        std::fs::create_dir_all(repo.path().join("src/deep")).expect("mkdir");
        let config = FleetConfig::default();
        let target = resolve_target(&repo.path().join("src/deep"), &config);
        assert_eq!(target.path, repo.path());
    }

    #[test]
    fn clean_repo_passes_and_merge_is_skipped() {
        let repo = TestRepo::new().expect("repo");
        let config = FleetConfig {
            push: PushPolicy::Upstream,
            ..FleetConfig::default()
        };
        let target = resolve_target(repo.path(), &config);
        assert!(inspect(&target, &config).expect("inspect").verdict.is_safe());

        repo.simulate_merge_in_progress().expect("merge");
        let verdict = inspect(&target, &config).expect("inspect").verdict;
        assert!(matches!(
            verdict,
            Verdict::Unsafe {
                reason: ReasonCode::MergeInProgress,
                ..
            }
        ));
    }

    #[test]
    fn repo_override_lowers_untracked_ceiling() {
        let repo = TestRepo::new().expect("repo");
        repo.write("a.txt", "a").expect("write");
        repo.write("b.txt", "b").expect("write");
        let config = FleetConfig {
            repos: vec![RepoEntry {
                path: repo.path().to_path_buf(),
                max_untracked: Some(1),
                ..RepoEntry::default()
            }],
            ..FleetConfig::default()
        };
        let target = resolve_target(repo.path(), &config);
        assert_eq!(target.overrides.max_untracked, Some(1));
        let verdict = inspect(&target, &config).expect("inspect").verdict;
        assert!(matches!(
            verdict,
            Verdict::Unsafe {
                reason: ReasonCode::TooManyUntracked,
                ..
            }
        ));
    }

    #[test]
    fn unavailable_backend_is_a_missing_dependency() {
        let driver = ScriptedDriver::new().unavailable();
        let err = check_dependencies(ExecMode::Full, &driver).unwrap_err();
        assert!(matches!(
            FleetError::find(&err),
            Some(FleetError::DependencyMissing(_))
        ));
        check_dependencies(ExecMode::Apply, &driver).expect("apply needs no agent");
    }
}
