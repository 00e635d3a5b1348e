//! Shared backoff file (`backoff.json`) read by every worker before new work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::core::backoff::{self, BackoffPolicy, BackoffState, MAX_JITTER};
use crate::error::FleetError;
use crate::io::atomic::{read_json, remove_if_exists, write_json};
use crate::io::lock::{Lease, LeaseConfig, lease_path};
use crate::io::signals::Interrupt;

/// Longest single sleep before re-reading the file (another worker may extend the pause).
const RECHECK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BackoffStore {
    path: PathBuf,
    lease: PathBuf,
    lease_config: LeaseConfig,
    interrupt: Interrupt,
}

impl BackoffStore {
    pub fn new(state_dir: &Path, lease_config: LeaseConfig, interrupt: Interrupt) -> Self {
        Self {
            path: state_dir.join("backoff.json"),
            lease: lease_path(state_dir, "backoff"),
            lease_config,
            interrupt,
        }
    }

    /// Reads need no lease: writers replace the file atomically.
    pub fn load(&self) -> Result<Option<BackoffState>> {
        read_json(&self.path)
    }

    /// Fold a rate-limit signal into the shared pause.
    pub fn record_rate_limit(&self, reason: &str, policy: &BackoffPolicy) -> Result<BackoffState> {
        let jitter = rand::thread_rng().gen_range(-MAX_JITTER..=MAX_JITTER);
        self.record_rate_limit_at(reason, policy, Utc::now(), jitter)
    }

    pub fn record_rate_limit_at(
        &self,
        reason: &str,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
        jitter: f64,
    ) -> Result<BackoffState> {
        let _lease = Lease::acquire(&self.lease, &self.lease_config, &self.interrupt)?;
        let existing = self.load()?;
        let next = backoff::on_rate_limit(existing.as_ref(), reason, now, jitter, policy);
        write_json(&self.path, &next)?;
        warn!(
            reason,
            pause_until = %next.pause_until,
            delay_ms = next.delay_ms,
            "rate limited; pausing all workers"
        );
        Ok(next)
    }

    /// Remove the file if its window lapsed. Returns true when cleared.
    pub fn clear_if_lapsed(&self, now: DateTime<Utc>) -> Result<bool> {
        let _lease = Lease::acquire(&self.lease, &self.lease_config, &self.interrupt)?;
        match self.load()? {
            Some(state) if !state.is_active(now) => {
                remove_if_exists(&self.path)?;
                info!(reason = %state.reason, "backoff window lapsed; resuming");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Block while a pause is active. Fails with [`FleetError::Interrupted`]
    /// when the interrupt fires. Returns how long it waited.
    pub fn wait_if_paused(&self) -> Result<Duration> {
        let mut waited = Duration::ZERO;
        loop {
            let now = Utc::now();
            let Some(state) = self.load()? else {
                return Ok(waited);
            };
            let Some(remaining) = state.remaining(now) else {
                self.clear_if_lapsed(now)?;
                return Ok(waited);
            };
            debug!(remaining_ms = remaining.as_millis() as u64, "waiting for backoff");
            let slice = remaining.min(RECHECK);
            if !self.interrupt.sleep(slice) {
                return Err(FleetError::Interrupted.into());
            }
            waited += slice;
        }
    }
}
