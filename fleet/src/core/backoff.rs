//! Pure backoff arithmetic for the shared rate-limit pause.
//!
//! The persisted [`BackoffState`] is created on the first rate-limit signal,
//! pushed forward (never backward) by later signals inside the pause window,
//! and cleared by whoever observes that the window lapsed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest jitter applied to a delay, as a fraction of the delay.
pub const MAX_JITTER: f64 = 0.25;

/// Shared pause record (`backoff.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffState {
    pub reason: String,
    pub pause_until: DateTime<Utc>,
    /// Un-jittered delay that produced `pause_until`; the next signal doubles it.
    pub delay_ms: u64,
}

impl BackoffState {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.pause_until > now
    }

    /// Time left in the pause window, or `None` once it lapsed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.pause_until - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// `min(previous * 2, max)`, or the base delay when there is no active pause.
pub fn next_delay(previous: Option<Duration>, policy: &BackoffPolicy) -> Duration {
    match previous {
        Some(prev) => prev.saturating_mul(2).min(policy.max_delay),
        None => policy.base_delay.min(policy.max_delay),
    }
}

/// Scale `delay` by `1 + jitter`, with `jitter` clamped to ±[`MAX_JITTER`].
pub fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter = if jitter.is_finite() {
        jitter.clamp(-MAX_JITTER, MAX_JITTER)
    } else {
        0.0
    };
    delay.mul_f64(1.0 + jitter)
}

/// Fold a new rate-limit signal into the shared state.
///
/// `pause_until` never moves backwards while the existing window is active,
/// even when jitter would shorten the new candidate.
pub fn on_rate_limit(
    existing: Option<&BackoffState>,
    reason: &str,
    now: DateTime<Utc>,
    jitter: f64,
    policy: &BackoffPolicy,
) -> BackoffState {
    let active = existing.filter(|state| state.is_active(now));
    let previous = active.map(|state| Duration::from_millis(state.delay_ms));
    let delay = next_delay(previous, policy);
    let jittered = apply_jitter(delay, jitter);
    let candidate = now + chrono::Duration::from_std(jittered).unwrap_or(chrono::Duration::MAX);

    let pause_until = match active {
        Some(state) if state.pause_until > candidate => state.pause_until,
        _ => candidate,
    };

    BackoffState {
        reason: reason.to_string(),
        pause_until,
        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
    }
}
