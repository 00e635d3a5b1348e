//! `fleet run` and `fleet status`: run lifecycle, resume, and summaries.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::types::{ReasonCode, RepoOutcome, RepoStatus, WorkItem};
use crate::error::FleetError;
use crate::exit_codes;
use crate::governor::Governor;
use crate::guardrails::Guardrails;
use crate::io::backoff_store::BackoffStore;
use crate::io::config::FleetConfig;
use crate::io::ledger::{Ledger, LedgerEntry};
use crate::io::lock::{Lease, LeaseConfig, lease_path};
use crate::io::queue::WorkQueue;
use crate::io::run_state::{RunLifecycle, RunState, RunStateStore};
use crate::io::session::SessionDriver;
use crate::io::signals::Interrupt;
use crate::pipeline::PipelineContext;
use crate::preflight::{check_dependencies, resolve_target};
use crate::worker::{WorkerShared, run_worker};

/// Invocation problem that maps to the invalid-arguments exit code.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UsageError(pub String);

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub repos: Vec<PathBuf>,
    pub resume: bool,
    pub restart: bool,
    /// Hold the queue lease this long per dequeue (tests only).
    pub dequeue_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub resumed: bool,
    /// Ledger outcomes of repositories finished by earlier invocations of
    /// this run.
    pub earlier: Vec<RepoOutcome>,
    pub outcomes: Vec<RepoOutcome>,
    pub interrupted: bool,
    /// Items that still need processing (`--resume` continues them).
    pub remaining: usize,
}

impl RunSummary {
    /// Exit code for automation, over the whole run including earlier
    /// invocations.
    ///
    /// Interruption dominates. Validation rejections yield `2` only when
    /// nothing completed and every failure was a rejection; any other
    /// failure yields `1`.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            return exit_codes::INTERRUPTED;
        }
        let all = || self.earlier.iter().chain(&self.outcomes);
        let failures: Vec<&RepoOutcome> = all()
            .filter(|o| o.status == RepoStatus::Failed)
            .collect();
        if failures.is_empty() {
            return exit_codes::OK;
        }
        let completed = all().any(|o| o.status == RepoStatus::Completed);
        let all_rejections = failures
            .iter()
            .all(|o| o.reason.is_some_and(ReasonCode::is_validation));
        if !completed && all_rejections {
            exit_codes::VALIDATION_REJECTED
        } else {
            exit_codes::PARTIAL_FAILURE
        }
    }

    pub fn count(&self, status: RepoStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

fn new_run_id() -> String {
    format!(
        "{}-{:04x}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        rand::random::<u16>()
    )
}

/// Execute a run.
///
/// `config` already carries command-line overrides. Fails only on startup
/// problems (dependencies, arguments, another active run) and shared-resource
/// failures; per-repository failures are in the summary.
#[instrument(skip_all, fields(state_dir = %config.state_dir.display()))]
pub fn execute(
    config: &FleetConfig,
    options: &RunOptions,
    driver: &dyn SessionDriver,
    interrupt: &Interrupt,
) -> Result<RunSummary> {
    if options.resume && options.restart {
        return Err(UsageError("--resume and --restart are mutually exclusive".into()).into());
    }
    let state_dir = config.state_dir.as_path();
    fs::create_dir_all(state_dir)
        .with_context(|| format!("create state dir {}", state_dir.display()))?;

    let _run_lease = Lease::acquire(
        &lease_path(state_dir, "run"),
        &LeaseConfig::fail_fast(),
        interrupt,
    )
    .map_err(|err| match FleetError::find(&err) {
        Some(FleetError::LockTimeout { owner_pid, .. }) => anyhow::Error::from(UsageError(format!(
            "another run is active in {} (pid {owner_pid:?})",
            state_dir.display()
        ))),
        _ => err,
    })?;

    let shared_lease = config.lock.shared();
    // Checkpoint writes must still land after Ctrl-C, so they never observe it.
    let store = RunStateStore::new(state_dir, shared_lease, Interrupt::default());
    let queue = WorkQueue::new(state_dir, shared_lease, interrupt.clone());
    #[cfg(any(test, feature = "test-support"))]
    let queue = match options.dequeue_delay {
        Some(delay) => queue.with_dequeue_delay(delay),
        None => queue,
    };
    let ledger = Ledger::new(state_dir);

    let existing = store.load()?;
    if options.restart && let Some(previous) = &existing {
        warn!(run_id = %previous.run_id, "discarding previous run state");
        store.discard()?;
        queue.clear()?;
    }
    let existing = existing.filter(|_| !options.restart);

    let mut recovered = Vec::new();
    let (mut state, resumed) = match existing {
        Some(state) if options.resume => {
            let state = recover(state, &store, &ledger, &mut recovered)?;
            (state, true)
        }
        Some(state) => {
            return Err(UsageError(format!(
                "unfinished run {} in {}; pass --resume or --restart",
                state.run_id,
                state_dir.display()
            ))
            .into());
        }
        None if options.resume => {
            return Err(UsageError(format!(
                "nothing to resume in {}",
                state_dir.display()
            ))
            .into());
        }
        None => (fresh_state(config, &options.repos)?, false),
    };

    check_dependencies(state.mode, driver)?;

    let earlier: Vec<RepoOutcome> = if resumed {
        ledger
            .final_outcomes(&state.run_id)?
            .into_iter()
            .filter(|o| !recovered.iter().any(|r| r.repo == o.repo))
            .collect()
    } else {
        Vec::new()
    };
    let pending = state.remaining();
    info!(
        run_id = %state.run_id,
        resumed,
        pending = pending.len(),
        done = state.completed.len(),
        earlier_failed = earlier.iter().filter(|o| o.status == RepoStatus::Failed).count(),
        "starting run"
    );
    state.lifecycle = RunLifecycle::Planned;
    store.save(&state)?;
    queue.enqueue_all(pending.clone())?;
    state.lifecycle = RunLifecycle::Executing;
    store.save(&state)?;

    let mut run_config = config.clone();
    run_config.task = state.task;
    run_config.mode = state.mode;
    let guardrails = Guardrails::new(&config.guardrails, config.timeouts.validating())?;
    let governor = Governor::new(
        BackoffStore::new(state_dir, shared_lease, interrupt.clone()),
        config.governor.backoff_policy(),
        config.governor.breaker(),
        interrupt.clone(),
    );
    let fatal = AtomicBool::new(false);
    let shared = WorkerShared {
        pipeline: PipelineContext {
            config: &run_config,
            state_dir,
            run_id: &state.run_id,
            driver,
            guardrails: &guardrails,
            governor: &governor,
            interrupt,
        },
        task: state.task,
        queue: &queue,
        store: &store,
        ledger: &ledger,
        fatal: &fatal,
    };

    let workers = config.parallelism.min(pending.len()).max(1);
    let results: Vec<Result<Vec<RepoOutcome>>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|index| {
                let shared = &shared;
                scope.spawn(move || run_worker(index, shared))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("worker thread panicked")))
            })
            .collect()
    });

    let mut outcomes = recovered;
    let mut fatal_error = None;
    for result in results {
        match result {
            Ok(mut list) => outcomes.append(&mut list),
            Err(err) => {
                if fatal_error.is_none() {
                    fatal_error = Some(err);
                }
            }
        }
    }
    outcomes.sort_by(|a, b| a.repo.cmp(&b.repo));

    let final_state = store.load()?.unwrap_or(state);
    let remaining = final_state.remaining().len();
    if let Some(err) = fatal_error {
        // In-flight entries stay: one of them may have mutated its repository
        // before the failure, and resume has to see that.
        let marked = store.update(|s| s.lifecycle = RunLifecycle::Failed);
        if let Err(save_err) = marked {
            warn!(err = %save_err, "failed to mark run as failed");
        }
        return Err(err.context(format!(
            "run {} aborted; fix the cause and rerun with --resume",
            final_state.run_id
        )));
    }

    let interrupted = (interrupt.is_set() && remaining > 0)
        || outcomes.iter().any(|o| o.status == RepoStatus::Interrupted);
    if interrupted {
        store.update(|s| {
            s.lifecycle = RunLifecycle::Interrupted;
            s.in_flight.clear();
        })?;
        warn!(run_id = %final_state.run_id, remaining, "run interrupted; resume with --resume");
    } else if remaining == 0 {
        store.update(|s| s.lifecycle = RunLifecycle::Completed)?;
        store.discard()?;
        queue.clear()?;
        info!(run_id = %final_state.run_id, "run completed");
    }

    Ok(RunSummary {
        run_id: final_state.run_id,
        resumed,
        earlier,
        outcomes,
        interrupted,
        remaining,
    })
}

fn fresh_state(config: &FleetConfig, repos: &[PathBuf]) -> Result<RunState> {
    if repos.is_empty() {
        return Err(UsageError("no repositories given".into()).into());
    }
    let mut items: Vec<WorkItem> = repos
        .iter()
        .map(|path| WorkItem {
            target: resolve_target(path, config),
            task: config.task,
            mode: config.mode,
        })
        .collect();
    items.sort_by(|a, b| a.target.id.cmp(&b.target.id));
    items.dedup_by(|a, b| a.target.id == b.target.id);
    Ok(RunState::new(new_run_id(), config.task, config.mode, items))
}

/// Bring a checkpoint up to date after a crash or interruption.
///
/// Ledger lines missing from the checkpoint are folded in. Items that had
/// entered execution without a ledger line are not retried: their mutation
/// may have happened, so they are recorded as failed for manual inspection.
fn recover(
    mut state: RunState,
    store: &RunStateStore,
    ledger: &Ledger,
    recovered: &mut Vec<RepoOutcome>,
) -> Result<RunState> {
    let entries = ledger.entries_for_run(&state.run_id)?;
    let reconciled = state.reconcile(&entries);
    if reconciled > 0 {
        info!(reconciled, "folded ledger results into checkpoint");
    }

    let in_flight: Vec<_> = std::mem::take(&mut state.in_flight).into_values().collect();
    for item in in_flight {
        if !item.may_have_mutated() || state.is_completed(&item.repo) {
            continue;
        }
        let outcome = RepoOutcome::with_reason(
            &item.repo,
            RepoStatus::Failed,
            ReasonCode::InterruptedDuringExecute,
            format!(
                "run stopped after execution began (started {}); verify the repository by hand",
                item.started_at.to_rfc3339()
            ),
            Duration::ZERO,
        );
        warn!(repo = %item.repo, "item was executing when the run stopped; not retrying");
        ledger.append(&LedgerEntry::from_outcome(&state.run_id, state.task, &outcome))?;
        state.mark_completed(&item.repo);
        recovered.push(outcome);
    }
    state.updated_at = Utc::now();
    store.save(&state)?;
    Ok(state)
}

/// Human-readable checkpoint, queue, and backoff state for `fleet status`.
pub fn status(state_dir: &Path, lock: &LeaseConfig) -> Result<String> {
    let interrupt = Interrupt::default();
    let store = RunStateStore::new(state_dir, *lock, interrupt.clone());
    let queue = WorkQueue::new(state_dir, *lock, interrupt.clone());
    let backoff = BackoffStore::new(state_dir, *lock, interrupt);

    let mut out = String::new();
    match store.load()? {
        Some(state) => {
            let total = state.items.len();
            writeln!(out, "run {} ({:?})", state.run_id, state.lifecycle)?;
            writeln!(
                out,
                "  task {} mode {}: {}/{} done, {} queued",
                state.task.as_str(),
                state.mode.as_str(),
                state.completed.len(),
                total,
                queue.pending()?.len()
            )?;
            for (worker, item) in &state.in_flight {
                writeln!(
                    out,
                    "  worker {worker}: {} ({})",
                    item.repo,
                    item.phase.as_str()
                )?;
            }
            if let Some(last) = &state.last_success {
                writeln!(out, "  last success: {last}")?;
            }
        }
        None => writeln!(out, "no active run in {}", state_dir.display())?,
    }
    match backoff.load()? {
        Some(pause) if pause.is_active(Utc::now()) => writeln!(
            out,
            "backoff: paused until {} ({})",
            pause.pause_until.to_rfc3339(),
            pause.reason
        )?,
        _ => writeln!(out, "backoff: none")?,
    }
    Ok(out)
}

/// One line per outcome, with remediation hints for skipped repositories.
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    for outcome in &summary.outcomes {
        let _ = write!(out, "{:<11} {}", outcome.status.as_str(), outcome.repo);
        if let Some(reason) = outcome.reason {
            let _ = write!(out, "  [{reason}]");
        }
        if let Some(result) = &outcome.result {
            let _ = write!(out, "  {result}");
        } else if let Some(detail) = &outcome.detail {
            let _ = write!(out, "  {detail}");
        }
        out.push('\n');
        if let Some(hint) = outcome.reason.and_then(ReasonCode::remediation) {
            let _ = writeln!(out, "            fix: {hint}");
        }
    }
    let _ = writeln!(
        out,
        "run {}: {} completed, {} failed, {} skipped{}{}",
        summary.run_id,
        summary.count(RepoStatus::Completed),
        summary.count(RepoStatus::Failed),
        summary.count(RepoStatus::Skipped),
        if summary.earlier.is_empty() {
            String::new()
        } else {
            format!(
                " ({} finished earlier, {} of them failed)",
                summary.earlier.len(),
                summary
                    .earlier
                    .iter()
                    .filter(|o| o.status == RepoStatus::Failed)
                    .count()
            )
        },
        if summary.interrupted {
            format!(", interrupted with {} remaining (resume with --resume)", summary.remaining)
        } else {
            String::new()
        }
    );
    out
}
