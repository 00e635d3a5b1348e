//! Append-only per-repository result ledger (`ledger.jsonl`).

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::{ReasonCode, RepoOutcome, RepoStatus, TaskKind};

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub run_id: String,
    pub repo: String,
    pub action: String,
    pub status: RepoStatus,
    pub duration_ms: u64,
    pub reason: Option<ReasonCode>,
    pub detail: Option<String>,
    pub result: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_outcome(run_id: &str, task: TaskKind, outcome: &RepoOutcome) -> Self {
        Self {
            run_id: run_id.to_string(),
            repo: outcome.repo.clone(),
            action: task.as_str().to_string(),
            status: outcome.status,
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
            reason: outcome.reason,
            detail: outcome.detail.clone(),
            result: outcome.result.clone(),
            timestamp: Utc::now(),
        }
    }

    /// The outcome this line recorded.
    pub fn outcome(&self) -> RepoOutcome {
        RepoOutcome {
            repo: self.repo.clone(),
            status: self.status,
            reason: self.reason,
            detail: self.detail.clone(),
            result: self.result.clone(),
            duration: Duration::from_millis(self.duration_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("ledger.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line and flush it to disk.
    pub fn append(&self, entry: &LedgerEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(entry).context("serialize ledger entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        if ends_mid_line(&mut file)? {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())
            .with_context(|| format!("append ledger {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync ledger {}", self.path.display()))?;
        Ok(())
    }

    /// Every parseable line. A torn final line (crash mid-append) is skipped.
    pub fn read_all(&self) -> Result<Vec<LedgerEntry>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read ledger {}", self.path.display()));
            }
        };
        let mut entries = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(line = idx + 1, err = %err, "skipping malformed ledger line"),
            }
        }
        Ok(entries)
    }

    pub fn entries_for_run(&self, run_id: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.run_id == run_id)
            .collect())
    }

    /// Latest terminal outcome per repository for `run_id`, sorted by repo.
    pub fn final_outcomes(&self, run_id: &str) -> Result<Vec<RepoOutcome>> {
        let mut latest = BTreeMap::new();
        for entry in self.entries_for_run(run_id)? {
            if entry.status.is_terminal() {
                latest.insert(entry.repo.clone(), entry.outcome());
            }
        }
        Ok(latest.into_values().collect())
    }
}

fn ends_mid_line(file: &mut fs::File) -> Result<bool> {
    let len = file.metadata().context("stat ledger")?.len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1)).context("seek ledger")?;
    file.read_exact(&mut last).context("read ledger tail")?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn appends_one_line_per_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(temp.path());
        let ok = RepoOutcome::completed("/a", Some("abc123".into()), Duration::from_millis(1500));
        let skipped = RepoOutcome::with_reason(
            "/b",
            RepoStatus::Skipped,
            ReasonCode::MergeInProgress,
            "merge in progress",
            Duration::from_millis(3),
        );
        ledger
            .append(&LedgerEntry::from_outcome("run-1", TaskKind::Commit, &ok))
            .expect("append");
        ledger
            .append(&LedgerEntry::from_outcome("run-2", TaskKind::Commit, &skipped))
            .expect("append");

        let raw = fs::read_to_string(ledger.path()).expect("read");
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("\"reason\":\"merge_in_progress\""));

        let run1 = ledger.entries_for_run("run-1").expect("entries");
        assert_eq!(run1.len(), 1);
        assert_eq!(run1[0].duration_ms, 1500);
        assert_eq!(run1[0].result.as_deref(), Some("abc123"));
    }

    #[test]
    fn torn_last_line_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(temp.path());
        let ok = RepoOutcome::completed("/a", None, Duration::ZERO);
        ledger
            .append(&LedgerEntry::from_outcome("run-1", TaskKind::Release, &ok))
            .expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(ledger.path())
            .expect("open");
        file.write_all(b"{\"run_id\":\"run-1\",\"re").expect("write");

        let entries = ledger.read_all().expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "release");

        let next = RepoOutcome::completed("/b", None, Duration::ZERO);
        ledger
            .append(&LedgerEntry::from_outcome("run-1", TaskKind::Release, &next))
            .expect("append after torn line");
        let repos: Vec<String> = ledger
            .read_all()
            .expect("read")
            .into_iter()
            .map(|e| e.repo)
            .collect();
        assert_eq!(repos, vec!["/a", "/b"]);
    }
}
