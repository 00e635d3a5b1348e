//! Security guardrails applied to every agent plan before execution.
//!
//! Checks run independently and each records its own result; the first
//! failing check (schema, denylist, size/type, secret scan, drift) supplies
//! the reason code. A plan that fails any check is never executed.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::denylist::Denylist;
use crate::core::plan::{AgentPlan, FileOpKind, parse_plan};
use crate::core::types::ReasonCode;
use crate::io::config::{DenylistMode, GuardrailConfig};
use crate::io::git::Git;
use crate::io::secret_scan::{SecretFinding, SecretScanner};

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF: usize = 8000;

/// Per-check results; `None` means the check could not run (schema failed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckResults {
    pub schema: Option<bool>,
    pub denylist: Option<bool>,
    pub size_limit: Option<bool>,
    pub secret_scan: Option<bool>,
    pub drift: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DenylistHit {
    pub path: String,
    pub pattern: String,
}

/// Outcome of validating one plan. Written to the audit directory as-is.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub checks: CheckResults,
    pub reason: Option<ReasonCode>,
    pub detail: Option<String>,
    pub schema_errors: Vec<String>,
    pub denylisted: Vec<DenylistHit>,
    /// Paths removed from the plan in `strip` mode.
    pub stripped: Vec<String>,
    pub oversized: Vec<String>,
    pub binary: Vec<String>,
    /// Staged paths that are missing or not a plain file or symlink.
    pub not_files: Vec<String>,
    pub secret_findings: Vec<SecretFinding>,
    pub scanner: &'static str,
    pub expected_fingerprint: String,
    pub actual_fingerprint: Option<String>,
}

impl ValidationResult {
    fn new(scanner: &'static str, expected_fingerprint: &str) -> Self {
        Self {
            passed: false,
            checks: CheckResults::default(),
            reason: None,
            detail: None,
            schema_errors: Vec::new(),
            denylisted: Vec::new(),
            stripped: Vec::new(),
            oversized: Vec::new(),
            binary: Vec::new(),
            not_files: Vec::new(),
            secret_findings: Vec::new(),
            scanner,
            expected_fingerprint: expected_fingerprint.to_string(),
            actual_fingerprint: None,
        }
    }

    fn fail(&mut self, reason: ReasonCode, detail: String) {
        if self.reason.is_none() {
            self.reason = Some(reason);
            self.detail = Some(detail);
        }
    }
}

/// Compiled guardrail configuration.
#[derive(Debug, Clone)]
pub struct Guardrails {
    denylist: Denylist,
    mode: DenylistMode,
    max_file_bytes: u64,
    allow_binary: GlobSet,
    allow_large: GlobSet,
    scanner: SecretScanner,
}

impl Guardrails {
    pub fn new(config: &GuardrailConfig, scan_timeout: Duration) -> Result<Self> {
        Ok(Self {
            denylist: Denylist::new(&config.denylist)?,
            mode: config.denylist_mode,
            max_file_bytes: config.max_file_bytes,
            allow_binary: glob_set(&config.allow_binary).context("guardrails.allow_binary")?,
            allow_large: glob_set(&config.allow_large).context("guardrails.allow_large")?,
            scanner: SecretScanner::new(config.secret_scanner, scan_timeout),
        })
    }

    /// Validate `raw` against the repository at `git`.
    ///
    /// Returns the result and, when every check passed, the plan that may be
    /// executed (denylisted paths already removed in `strip` mode). I/O
    /// failures while inspecting the repository are errors, not verdicts.
    #[instrument(skip_all, fields(repo = %git.workdir().display()))]
    pub fn validate(
        &self,
        raw: &Value,
        git: &Git,
        expected_fingerprint: &str,
    ) -> Result<(ValidationResult, Option<AgentPlan>)> {
        let mut result = ValidationResult::new(self.scanner.name(), expected_fingerprint);

        let mut plan = match parse_plan(raw) {
            Ok(plan) => {
                result.checks.schema = Some(true);
                Some(plan)
            }
            Err(errors) => {
                result.checks.schema = Some(false);
                result.fail(ReasonCode::SchemaInvalid, errors.join("; "));
                result.schema_errors = errors;
                None
            }
        };

        if let Some(plan) = plan.as_mut() {
            result.checks.denylist = Some(self.check_denylist(plan, &mut result));
            result.checks.size_limit = Some(self.check_size(plan, git.workdir(), &mut result)?);
            result.checks.secret_scan = Some(self.check_secrets(plan, git.workdir(), &mut result)?);
        }

        let actual = git.fingerprint()?;
        let drift_ok = actual == expected_fingerprint;
        result.checks.drift = Some(drift_ok);
        if !drift_ok {
            result.fail(
                ReasonCode::DriftDetected,
                "repository changed since the plan was created".to_string(),
            );
        }
        result.actual_fingerprint = Some(actual);

        result.passed = result.reason.is_none();
        if result.passed {
            debug!("plan passed guardrails");
            Ok((result, plan))
        } else {
            info!(reason = ?result.reason, detail = ?result.detail, "plan rejected");
            Ok((result, None))
        }
    }

    fn check_denylist(&self, plan: &mut AgentPlan, result: &mut ValidationResult) -> bool {
        for op in plan.files() {
            if let Some(pattern) = self.denylist.matches(&op.path) {
                result.denylisted.push(DenylistHit {
                    path: op.path.clone(),
                    pattern: pattern.to_string(),
                });
            }
        }
        if result.denylisted.is_empty() {
            return true;
        }
        let summary = result
            .denylisted
            .iter()
            .map(|hit| format!("{} matches {}", hit.path, hit.pattern))
            .collect::<Vec<_>>()
            .join(", ");

        match self.mode {
            DenylistMode::Reject => {
                result.fail(ReasonCode::Denylist, summary);
                false
            }
            DenylistMode::Strip => {
                let denied: Vec<String> = result.denylisted.iter().map(|h| h.path.clone()).collect();
                result.stripped = plan.retain_files(|op| !denied.contains(&op.path));
                if plan.files().is_empty() {
                    result.fail(ReasonCode::Denylist, format!("no files left after removing {summary}"));
                    return false;
                }
                info!(stripped = ?result.stripped, "removed denylisted paths from plan");
                true
            }
        }
    }

    fn check_size(&self, plan: &AgentPlan, root: &Path, result: &mut ValidationResult) -> Result<bool> {
        for op in plan.files().iter().filter(|op| op.op == FileOpKind::Stage) {
            let file = root.join(&op.path);
            // A directory would stage everything below it, unchecked.
            let meta = match fs::symlink_metadata(&file) {
                Ok(meta) if meta.is_file() => meta,
                Ok(meta) if meta.file_type().is_symlink() => continue,
                _ => {
                    result.not_files.push(op.path.clone());
                    continue;
                }
            };
            if meta.len() > self.max_file_bytes && !self.allow_large.is_match(&op.path) {
                result.oversized.push(op.path.clone());
            }
            if !self.allow_binary.is_match(&op.path) && is_binary(&file)? {
                result.binary.push(op.path.clone());
            }
        }
        if !result.not_files.is_empty() {
            result.fail(
                ReasonCode::NotARegularFile,
                format!(
                    "staged paths must be existing files: {}",
                    result.not_files.join(", ")
                ),
            );
        }
        if !result.oversized.is_empty() {
            result.fail(
                ReasonCode::SizeLimit,
                format!(
                    "{} exceed {} bytes",
                    result.oversized.join(", "),
                    self.max_file_bytes
                ),
            );
        }
        if !result.binary.is_empty() {
            result.fail(
                ReasonCode::BinaryFile,
                format!("binary files not allowed: {}", result.binary.join(", ")),
            );
        }
        Ok(result.not_files.is_empty() && result.oversized.is_empty() && result.binary.is_empty())
    }

    fn check_secrets(&self, plan: &AgentPlan, root: &Path, result: &mut ValidationResult) -> Result<bool> {
        let staged: Vec<&str> = plan
            .files()
            .iter()
            .filter(|op| op.op == FileOpKind::Stage)
            .map(|op| op.path.as_str())
            .collect();
        let mut findings = self.scanner.scan_files(root, &staged)?;
        findings.extend(self.scanner.scan_message(plan.message()));
        if findings.is_empty() {
            return Ok(true);
        }
        let summary = findings
            .iter()
            .map(|f| format!("{} ({})", f.path, f.rule))
            .collect::<Vec<_>>()
            .join(", ");
        result.fail(ReasonCode::SecretDetected, summary);
        result.secret_findings = findings;
        Ok(false)
    }
}

fn glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{pattern}'"))?);
    }
    Ok(builder.build()?)
}

fn is_binary(path: &Path) -> Result<bool> {
    let mut buf = Vec::with_capacity(BINARY_SNIFF);
    File::open(path)
        .with_context(|| format!("open {}", path.display()))?
        .take(BINARY_SNIFF as u64)
        .read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(buf.contains(&0))
}
