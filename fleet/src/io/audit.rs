//! Per-repository audit artifacts under `audit/<run_id>/<slug>/`.
//!
//! Rejected plans are kept here too; nothing in this directory is ever
//! executed.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::core::pipeline::PipelineState;
use crate::core::types::{ReasonCode, RepoOutcome, RepoStatus};

#[derive(Debug, Clone)]
pub struct AuditPaths {
    pub dir: PathBuf,
    pub transcript_path: PathBuf,
    pub plan_path: PathBuf,
    pub validation_path: PathBuf,
    pub outcome_path: PathBuf,
}

impl AuditPaths {
    pub fn new(state_dir: &Path, run_id: &str, slug: &str) -> Self {
        let dir = state_dir.join("audit").join(run_id).join(slug);
        Self {
            transcript_path: dir.join("transcript.txt"),
            plan_path: dir.join("plan.json"),
            validation_path: dir.join("validation.json"),
            outcome_path: dir.join("outcome.json"),
            dir,
        }
    }
}

/// Final record for one repository, including the states it passed through.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRecord {
    pub repo: String,
    pub status: RepoStatus,
    pub reason: Option<ReasonCode>,
    pub detail: Option<String>,
    pub result: Option<String>,
    pub duration_ms: u64,
    pub states: Vec<PipelineState>,
}

impl OutcomeRecord {
    pub fn new(outcome: &RepoOutcome, states: &[PipelineState]) -> Self {
        Self {
            repo: outcome.repo.clone(),
            status: outcome.status,
            reason: outcome.reason,
            detail: outcome.detail.clone(),
            result: outcome.result.clone(),
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
            states: states.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    paths: AuditPaths,
}

impl AuditLog {
    pub fn new(state_dir: &Path, run_id: &str, slug: &str) -> Self {
        Self {
            paths: AuditPaths::new(state_dir, run_id, slug),
        }
    }

    pub fn paths(&self) -> &AuditPaths {
        &self.paths
    }

    pub fn write_transcript(&self, transcript: &str) -> Result<()> {
        self.write_text(&self.paths.transcript_path, transcript)
    }

    /// Raw plan as extracted, before (or despite) validation.
    pub fn write_plan(&self, raw: &Value) -> Result<()> {
        self.write_json(&self.paths.plan_path, raw)
    }

    pub fn write_validation<T: Serialize>(&self, report: &T) -> Result<()> {
        self.write_json(&self.paths.validation_path, report)
    }

    pub fn write_outcome(&self, record: &OutcomeRecord) -> Result<()> {
        self.write_json(&self.paths.outcome_path, record)
    }

    fn write_text(&self, path: &Path, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.paths.dir)
            .with_context(|| format!("create audit dir {}", self.paths.dir.display()))?;
        fs::write(path, contents).with_context(|| format!("write {}", path.display()))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(value)?;
        buf.push('\n');
        self.write_text(path, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn audit_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AuditPaths::new(temp.path(), "run-1", "app-1234abcd");

        assert!(paths.dir.ends_with(Path::new("audit/run-1/app-1234abcd")));
        assert!(paths.transcript_path.ends_with("transcript.txt"));
        assert!(paths.plan_path.ends_with("plan.json"));
        assert!(paths.validation_path.ends_with("validation.json"));
        assert!(paths.outcome_path.ends_with("outcome.json"));
    }

    #[test]
    fn writes_rejected_plan_and_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let audit = AuditLog::new(temp.path(), "run-9", "app-1");
        audit
            .write_plan(&serde_json::json!({"action": "commit", "files": [{"path": ".env"}]}))
            .expect("plan");
        audit.write_transcript("agent output").expect("transcript");
        let outcome = RepoOutcome::with_reason(
            "/src/app",
            RepoStatus::Failed,
            ReasonCode::Denylist,
            ".env matches .env",
            Duration::from_millis(10),
        );
        audit
            .write_outcome(&OutcomeRecord::new(
                &outcome,
                &[PipelineState::Initialized, PipelineState::Failed],
            ))
            .expect("outcome");

        let raw = fs::read_to_string(&audit.paths().outcome_path).expect("read");
        assert!(raw.contains("\"reason\": \"denylist\""));
        assert!(raw.contains("\"failed\""));
        assert!(audit.paths().plan_path.is_file());
    }
}
