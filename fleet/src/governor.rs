//! Rate governor: shared backoff plus the run-wide circuit breaker.
//!
//! Every worker calls [`Governor::admit`] before dequeuing. The backoff file
//! pauses all workers (across processes) after a rate-limit signal; the
//! breaker stops new work in this run after too many errors.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use crate::core::backoff::BackoffPolicy;
use crate::core::breaker::{Admission, BreakerConfig, BreakerState, CircuitBreaker};
use crate::core::types::{ReasonCode, RepoOutcome, RepoStatus};
use crate::error::FleetError;
use crate::io::backoff_store::BackoffStore;
use crate::io::signals::Interrupt;

/// Permission to take one item from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ticket {
    Normal,
    /// The single half-open probe.
    Probe,
}

#[derive(Debug)]
pub struct Governor {
    backoff: BackoffStore,
    policy: BackoffPolicy,
    breaker: Mutex<CircuitBreaker>,
    interrupt: Interrupt,
}

impl Governor {
    pub fn new(
        backoff: BackoffStore,
        policy: BackoffPolicy,
        breaker: BreakerConfig,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            backoff,
            policy,
            breaker: Mutex::new(CircuitBreaker::new(breaker)),
            interrupt,
        }
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        // A worker panicking while holding the lock leaves valid data behind.
        self.breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker().state(Instant::now())
    }

    /// Block until new work may start.
    ///
    /// Fails with [`FleetError::Interrupted`] when the interrupt fires while
    /// waiting; any other error comes from the shared backoff file.
    pub fn admit(&self) -> Result<Ticket> {
        let mut announced = false;
        loop {
            if self.interrupt.is_set() {
                return Err(FleetError::Interrupted.into());
            }
            let waited = self.backoff.wait_if_paused()?;
            if !waited.is_zero() {
                info!(waited_ms = waited.as_millis() as u64, "backoff window elapsed");
            }
            let admission = self.breaker().admit(Instant::now());
            let wait = match admission {
                Admission::Normal => return Ok(Ticket::Normal),
                Admission::Probe => {
                    info!("circuit half-open; admitting one probe");
                    return Ok(Ticket::Probe);
                }
                Admission::Wait(wait) => wait,
            };
            if !announced {
                warn!(wait_ms = wait.as_millis() as u64, "circuit open; holding new work");
                announced = true;
            }
            if !self.interrupt.sleep(wait.min(Duration::from_secs(1))) {
                return Err(FleetError::Interrupted.into());
            }
        }
    }

    /// Hand back a ticket that was not used (queue drained).
    pub fn release(&self, ticket: Ticket) {
        if ticket == Ticket::Probe {
            self.breaker().release_probe();
        }
    }

    /// Feed one repository outcome into the breaker.
    pub fn report(&self, ticket: Ticket, outcome: &RepoOutcome) {
        let now = Instant::now();
        let mut breaker = self.breaker();
        if counts_as_error(outcome) {
            breaker.record_error(now);
            let state = breaker.state(now);
            if state == BreakerState::Open {
                warn!(
                    errors = breaker.error_count(),
                    repo = %outcome.repo,
                    "circuit breaker open"
                );
            }
        } else if outcome.status == RepoStatus::Completed {
            breaker.record_success(now);
        } else if ticket == Ticket::Probe {
            breaker.release_probe();
        }
    }

    /// Record a rate-limit signal in the shared backoff file.
    pub fn record_rate_limit(&self, reason: &str) -> Result<()> {
        self.backoff.record_rate_limit(reason, &self.policy)?;
        Ok(())
    }
}

/// Outcomes that say something about the agent backend's health.
pub fn counts_as_error(outcome: &RepoOutcome) -> bool {
    outcome.status == RepoStatus::Failed
        && matches!(
            outcome.reason,
            Some(
                ReasonCode::SessionError
                    | ReasonCode::PhaseTimeout
                    | ReasonCode::RateLimited
                    | ReasonCode::ExecutionFailed
                    | ReasonCode::PushFailed
            )
        )
}
