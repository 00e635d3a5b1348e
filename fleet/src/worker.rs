//! Worker loop: admit, dequeue, process, record.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::pipeline::PipelineState;
use crate::core::types::{RepoOutcome, RepoStatus, TaskKind};
use crate::error::FleetError;
use crate::io::ledger::{Ledger, LedgerEntry};
use crate::io::queue::WorkQueue;
use crate::io::run_state::{InFlight, RunStateStore};
use crate::pipeline::{PipelineContext, process_item};

/// Shared resources every worker of a run uses.
pub struct WorkerShared<'a> {
    pub pipeline: PipelineContext<'a>,
    pub task: TaskKind,
    pub queue: &'a WorkQueue,
    pub store: &'a RunStateStore,
    pub ledger: &'a Ledger,
    /// Set by the first worker that hits a shared-resource failure.
    pub fatal: &'a AtomicBool,
}

/// Drain the queue until it is empty, the run is interrupted, or another
/// worker failed fatally. Returns the outcomes this worker produced.
///
/// Errors are shared-resource failures (queue, checkpoint, ledger, backoff
/// file); per-repository failures are outcomes.
#[instrument(skip_all, fields(worker = index))]
pub fn run_worker(index: usize, shared: &WorkerShared<'_>) -> Result<Vec<RepoOutcome>> {
    let result = drain(index, shared);
    if result.is_err() {
        shared.fatal.store(true, Ordering::SeqCst);
    }
    result
}

fn drain(index: usize, shared: &WorkerShared<'_>) -> Result<Vec<RepoOutcome>> {
    let governor = shared.pipeline.governor;
    let interrupt = shared.pipeline.interrupt;
    let mut outcomes = Vec::new();

    loop {
        if interrupt.is_set() || shared.fatal.load(Ordering::SeqCst) {
            break;
        }
        let ticket = match governor.admit() {
            Ok(ticket) => ticket,
            Err(err) if matches!(FleetError::find(&err), Some(FleetError::Interrupted)) => break,
            Err(err) => return Err(err.context("rate governor")),
        };
        let item = match shared.queue.dequeue() {
            Ok(Some(item)) => item,
            Ok(None) => {
                governor.release(ticket);
                break;
            }
            Err(err) if matches!(FleetError::find(&err), Some(FleetError::Interrupted)) => {
                governor.release(ticket);
                break;
            }
            Err(err) => return Err(err.context("dequeue")),
        };
        let repo = item.target.id.clone();
        debug!(repo = %repo, "picked up");

        shared
            .store
            .update(|state| {
                state.in_flight.insert(index, InFlight::new(repo.clone()));
            })
            .context("checkpoint in-flight item")?;

        let mut on_phase = |phase: PipelineState| -> Result<()> {
            shared
                .store
                .update(|state| {
                    if let Some(entry) = state.in_flight.get_mut(&index) {
                        entry.enter(phase);
                    }
                })
                .map(|_| ())
                .context("checkpoint pipeline phase")
        };
        let outcome = process_item(&shared.pipeline, &item, &mut on_phase)?;
        governor.report(ticket, &outcome);
        record(index, shared, &outcome)?;
        log_outcome(&outcome);
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Ledger first, then checkpoint; resume reconciles the ledger into the
/// checkpoint, so a crash between the two never reruns the repository.
fn record(index: usize, shared: &WorkerShared<'_>, outcome: &RepoOutcome) -> Result<()> {
    let run_id = shared.pipeline.run_id;
    shared
        .ledger
        .append(&LedgerEntry::from_outcome(run_id, shared.task, outcome))
        .context("append ledger")?;
    shared
        .store
        .update(|state| {
            state.in_flight.remove(&index);
            if outcome.status.is_terminal() {
                state.mark_completed(&outcome.repo);
            }
            if outcome.status == RepoStatus::Completed {
                state.last_success = Some(outcome.repo.clone());
            }
        })
        .context("save checkpoint")?;
    Ok(())
}

fn log_outcome(outcome: &RepoOutcome) {
    let ms = outcome.duration.as_millis() as u64;
    match outcome.status {
        RepoStatus::Completed => {
            info!(repo = %outcome.repo, result = ?outcome.result, duration_ms = ms, "completed");
        }
        RepoStatus::Skipped | RepoStatus::Interrupted => info!(
            repo = %outcome.repo,
            status = outcome.status.as_str(),
            reason = ?outcome.reason,
            duration_ms = ms,
            "not processed"
        ),
        RepoStatus::Failed => warn!(
            repo = %outcome.repo,
            reason = ?outcome.reason,
            detail = ?outcome.detail,
            duration_ms = ms,
            "failed"
        ),
    }
}
