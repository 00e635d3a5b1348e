//! Layered secret scanning of plan files.
//!
//! `gitleaks` is used when installed; otherwise (or when it fails to run)
//! the pattern heuristics in [`crate::core::secrets`] apply. Findings carry
//! the rule name and path only, never the matched value.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::secrets;
use crate::io::atomic::remove_if_exists;
use crate::io::config::SecretScannerMode;
use crate::io::process::{DEFAULT_OUTPUT_LIMIT, find_executable, run_command_with_timeout};

/// gitleaks exit code for "leaks found".
const GITLEAKS_LEAKS: i32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretFinding {
    /// Plan path, or `<message>` for the commit/tag message.
    pub path: String,
    pub rule: String,
    pub scanner: &'static str,
}

#[derive(Debug, Deserialize)]
struct GitleaksFinding {
    #[serde(rename = "RuleID")]
    rule_id: String,
}

#[derive(Debug, Clone)]
pub struct SecretScanner {
    gitleaks: Option<PathBuf>,
    timeout: Duration,
}

impl SecretScanner {
    pub fn new(mode: SecretScannerMode, timeout: Duration) -> Self {
        let gitleaks = match mode {
            SecretScannerMode::Auto => find_executable("gitleaks"),
            SecretScannerMode::Heuristic => None,
        };
        debug!(gitleaks = ?gitleaks, "secret scanner configured");
        Self { gitleaks, timeout }
    }

    pub fn name(&self) -> &'static str {
        if self.gitleaks.is_some() {
            "gitleaks"
        } else {
            "heuristic"
        }
    }

    /// Scan each existing file under `root`. Missing paths (removals) are skipped.
    #[instrument(skip_all, fields(files = paths.len(), scanner = self.name()))]
    pub fn scan_files(&self, root: &Path, paths: &[&str]) -> Result<Vec<SecretFinding>> {
        let mut findings = Vec::new();
        for rel in paths {
            let file = root.join(rel);
            if !file.is_file() {
                continue;
            }
            let rules = match &self.gitleaks {
                Some(program) => match run_gitleaks(program, &file, self.timeout) {
                    Ok(rules) => rules
                        .into_iter()
                        .map(|rule| (rule, "gitleaks"))
                        .collect(),
                    Err(err) => {
                        warn!(err = %err, path = rel, "gitleaks failed; using heuristics");
                        heuristic_file(&file)?
                    }
                },
                None => heuristic_file(&file)?,
            };
            findings.extend(rules.into_iter().map(|(rule, scanner)| SecretFinding {
                path: (*rel).to_string(),
                rule,
                scanner,
            }));
        }
        Ok(findings)
    }

    /// Scan free text (commit or tag message) with the heuristics.
    pub fn scan_message(&self, message: &str) -> Vec<SecretFinding> {
        secrets::scan_text(message)
            .into_iter()
            .map(|rule| SecretFinding {
                path: "<message>".to_string(),
                rule: rule.to_string(),
                scanner: "heuristic",
            })
            .collect()
    }
}

fn heuristic_file(file: &Path) -> Result<Vec<(String, &'static str)>> {
    let bytes = fs::read(file).with_context(|| format!("read {}", file.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(secrets::scan_text(&text)
        .into_iter()
        .map(|rule| (rule.to_string(), "heuristic"))
        .collect())
}

fn run_gitleaks(program: &Path, file: &Path, timeout: Duration) -> Result<Vec<String>> {
    let report = std::env::temp_dir().join(format!(
        "fleet-gitleaks-{}-{:08x}.json",
        std::process::id(),
        rand::random::<u32>()
    ));
    let mut cmd = Command::new(program);
    cmd.args(["detect", "--no-git", "--no-banner", "--redact"])
        .arg("--exit-code")
        .arg(GITLEAKS_LEAKS.to_string())
        .args(["--report-format", "json", "--report-path"])
        .arg(&report)
        .arg("--source")
        .arg(file);
    let out = run_command_with_timeout(cmd, None, timeout, DEFAULT_OUTPUT_LIMIT);
    let parsed = out.and_then(|out| {
        if out.timed_out {
            return Err(anyhow!("gitleaks timed out"));
        }
        match out.status.code() {
            Some(0) => Ok(Vec::new()),
            Some(GITLEAKS_LEAKS) => {
                let raw = fs::read_to_string(&report).context("read gitleaks report")?;
                let findings: Vec<GitleaksFinding> =
                    serde_json::from_str(&raw).context("parse gitleaks report")?;
                Ok(findings.into_iter().map(|f| f.rule_id).collect())
            }
            code => Err(anyhow!(
                "gitleaks exited with {code:?}: {}",
                out.stderr_lossy().trim()
            )),
        }
    });
    if let Err(err) = remove_if_exists(&report) {
        warn!(err = %err, "failed to remove gitleaks report");
    }
    parsed
}
