//! Run checkpoint storage (`run_state.json`).
//!
//! Saved after every repository outcome, never batched, so a crash loses at
//! most the items that were in flight. Deleted on clean completion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::pipeline::PipelineState;
use crate::core::types::{ExecMode, TaskKind, WorkItem};
use crate::io::atomic::{read_json, remove_if_exists, write_json};
use crate::io::ledger::LedgerEntry;
use crate::io::lock::{Lease, LeaseConfig, lease_path};
use crate::io::signals::Interrupt;

/// Lifecycle of a whole invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLifecycle {
    Initialized,
    /// Work items are enqueued.
    Planned,
    Executing,
    Completed,
    /// Aborted on a shared-resource failure; resumable.
    Failed,
    Interrupted,
}

/// Item currently held by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub repo: String,
    pub phase: PipelineState,
    pub started_at: DateTime<Utc>,
    /// Set on entering `Executing` and kept through the terminal phase.
    #[serde(default)]
    pub mutating: bool,
}

impl InFlight {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            phase: PipelineState::Initialized,
            started_at: Utc::now(),
            mutating: false,
        }
    }

    pub fn enter(&mut self, phase: PipelineState) {
        self.phase = phase;
        self.mutating |= phase == PipelineState::Executing;
    }

    /// The repository may already carry this item's git mutation.
    pub fn may_have_mutated(&self) -> bool {
        self.mutating || self.phase == PipelineState::Executing
    }
}

/// Persisted checkpoint for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub lifecycle: RunLifecycle,
    pub task: TaskKind,
    pub mode: ExecMode,
    /// Every item of the run, as enqueued.
    pub items: Vec<WorkItem>,
    /// Repositories with a terminal outcome, in completion order.
    pub completed: Vec<String>,
    /// Keyed by worker index.
    pub in_flight: BTreeMap<usize, InFlight>,
    /// Last repository that completed successfully.
    pub last_success: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: String, task: TaskKind, mode: ExecMode, items: Vec<WorkItem>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            lifecycle: RunLifecycle::Initialized,
            task,
            mode,
            items,
            completed: Vec::new(),
            in_flight: BTreeMap::new(),
            last_success: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self, repo: &str) -> bool {
        self.completed.iter().any(|r| r == repo)
    }

    pub fn mark_completed(&mut self, repo: &str) {
        if !self.is_completed(repo) {
            self.completed.push(repo.to_string());
        }
        self.in_flight.retain(|_, item| item.repo != repo);
    }

    /// Items that have no terminal outcome yet, in enqueue order.
    pub fn remaining(&self) -> Vec<WorkItem> {
        self.items
            .iter()
            .filter(|item| !self.is_completed(&item.target.id))
            .cloned()
            .collect()
    }

    /// Fold ledger lines of this run into `completed`.
    ///
    /// Covers a crash between the ledger append and the checkpoint save.
    /// Returns how many repositories were added.
    pub fn reconcile(&mut self, entries: &[LedgerEntry]) -> usize {
        let mut added = 0;
        for entry in entries {
            if entry.run_id == self.run_id
                && entry.status.is_terminal()
                && !self.is_completed(&entry.repo)
            {
                self.mark_completed(&entry.repo);
                added += 1;
            }
        }
        added
    }
}

/// Checkpoint file plus the lease guarding it.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    path: PathBuf,
    lease: PathBuf,
    lease_config: LeaseConfig,
    interrupt: Interrupt,
}

impl RunStateStore {
    pub fn new(state_dir: &Path, lease_config: LeaseConfig, interrupt: Interrupt) -> Self {
        Self {
            path: state_dir.join("run_state.json"),
            lease: lease_path(state_dir, "state"),
            lease_config,
            interrupt,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<RunState>> {
        let state: Option<RunState> = read_json(&self.path)?;
        if let Some(state) = &state {
            debug!(run_id = %state.run_id, completed = state.completed.len(), "run state loaded");
        }
        Ok(state)
    }

    /// Atomically write the checkpoint (temp file + rename).
    pub fn save(&self, state: &RunState) -> Result<()> {
        debug!(run_id = %state.run_id, lifecycle = ?state.lifecycle, "saving run state");
        write_json(&self.path, state)
    }

    /// Take the state lease; callers load, mutate and save while holding it.
    pub fn lock(&self) -> Result<Lease> {
        Lease::acquire(&self.lease, &self.lease_config, &self.interrupt)
    }

    /// Load, apply `f`, stamp `updated_at`, and save under the state lease.
    pub fn update(&self, f: impl FnOnce(&mut RunState)) -> Result<Option<RunState>> {
        let _lease = self.lock()?;
        let Some(mut state) = self.load()? else {
            return Ok(None);
        };
        f(&mut state);
        state.updated_at = Utc::now();
        self.save(&state)?;
        Ok(Some(state))
    }

    pub fn discard(&self) -> Result<()> {
        debug!(path = %self.path.display(), "discarding run state");
        remove_if_exists(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::types::{ReasonCode, RepoOverrides, RepoStatus, RepoTarget};

    fn item(id: &str) -> WorkItem {
        WorkItem {
            target: RepoTarget {
                id: id.to_string(),
                path: PathBuf::from(id),
                branch: Some("main".into()),
                upstream: None,
                overrides: RepoOverrides::default(),
            },
            task: TaskKind::Commit,
            mode: ExecMode::Full,
        }
    }

    fn store(dir: &Path) -> RunStateStore {
        let lease = LeaseConfig {
            timeout: Duration::from_secs(5),
            stale_after: Some(Duration::from_secs(60)),
            poll: Duration::from_millis(2),
        };
        RunStateStore::new(dir, lease, Interrupt::default())
    }

    fn entry(run_id: &str, repo: &str, status: RepoStatus) -> LedgerEntry {
        LedgerEntry {
            run_id: run_id.into(),
            repo: repo.into(),
            action: "commit".into(),
            status,
            duration_ms: 1,
            reason: (status != RepoStatus::Completed).then_some(ReasonCode::Interrupted),
            detail: None,
            result: None,
            timestamp: Utc::now(),
        }
    }

    /// Verifies save → load preserves every field.
    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut state = RunState::new(
            "run-1".into(),
            TaskKind::Commit,
            ExecMode::Full,
            vec![item("/a"), item("/b")],
        );
        state.in_flight.insert(
            0,
            InFlight {
                phase: PipelineState::Planning,
                ..InFlight::new("/a")
            },
        );
        store.save(&state).expect("save");
        assert_eq!(store.load().expect("load"), Some(state));
    }

    #[test]
    fn update_without_state_is_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        assert!(store.update(|_| {}).expect("update").is_none());
        assert!(!store.path().exists());
    }

    /// Completion clears the worker slot and is recorded once.
    #[test]
    fn mark_completed_is_idempotent() {
        let mut state = RunState::new(
            "run-1".into(),
            TaskKind::Commit,
            ExecMode::Full,
            vec![item("/a"), item("/b")],
        );
        state.in_flight.insert(
            1,
            InFlight {
                phase: PipelineState::Executing,
                ..InFlight::new("/a")
            },
        );
        state.mark_completed("/a");
        state.mark_completed("/a");
        assert_eq!(state.completed, vec!["/a"]);
        assert!(state.in_flight.is_empty());
        assert_eq!(state.remaining().len(), 1);
    }

    #[test]
    fn mutation_mark_survives_the_terminal_phase() {
        let mut item = InFlight::new("/a");
        item.enter(PipelineState::Validated);
        assert!(!item.may_have_mutated());
        item.enter(PipelineState::Executing);
        item.enter(PipelineState::Completed);
        assert!(item.may_have_mutated());

        let legacy: InFlight = serde_json::from_str(
            r#"{"repo": "/a", "phase": "executing", "started_at": "2026-01-01T00:00:00Z"}"#,
        )
        .expect("parse");
        assert!(legacy.may_have_mutated());
    }

    /// Ledger lines of other runs and interrupted outcomes are ignored.
    #[test]
    fn reconcile_only_takes_terminal_lines_of_this_run() {
        let mut state = RunState::new(
            "run-1".into(),
            TaskKind::Commit,
            ExecMode::Full,
            vec![item("/a"), item("/b"), item("/c")],
        );
        let ledger = vec![
            entry("run-1", "/a", RepoStatus::Completed),
            entry("run-0", "/b", RepoStatus::Completed),
            entry("run-1", "/c", RepoStatus::Interrupted),
            entry("run-1", "/a", RepoStatus::Completed),
        ];
        assert_eq!(state.reconcile(&ledger), 1);
        assert_eq!(state.completed, vec!["/a"]);
    }
}
