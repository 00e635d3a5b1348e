//! Run-wide circuit breaker over caller-supplied instants.
//!
//! Closed: errors are counted in a trailing window; exceeding the threshold
//! opens the breaker. Open: nothing is admitted until a cool-down passes
//! with no new errors, then the breaker half-opens. Half-open: exactly one
//! probe is admitted; its success closes the breaker, any failure reopens it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How long a worker waits before asking again while a probe is running.
pub const PROBE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Errors tolerated inside one window; one more trips the breaker.
    pub threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

/// Whether a worker may dequeue new work right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open probe; report its outcome with
    /// [`CircuitBreaker::record_success`], [`CircuitBreaker::record_error`],
    /// or [`CircuitBreaker::release_probe`].
    Probe,
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    /// Error instants inside the trailing window, oldest first.
    recent: VecDeque<Instant>,
    last_error: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            recent: VecDeque::new(),
            last_error: None,
            probe_in_flight: false,
        }
    }

    /// Current state after applying any elapsed cool-down.
    pub fn state(&mut self, now: Instant) -> BreakerState {
        self.refresh(now);
        self.state
    }

    /// Errors recorded inside the trailing window as of the last update.
    pub fn error_count(&self) -> usize {
        self.recent.len()
    }

    fn push_error(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) > self.config.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.push_back(now);
    }

    fn refresh(&mut self, now: Instant) {
        if self.state == BreakerState::Open && self.cooldown_remaining(now).is_none() {
            self.state = BreakerState::HalfOpen;
            self.probe_in_flight = false;
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_error?;
        let elapsed = now.saturating_duration_since(last);
        self.config
            .cooldown
            .checked_sub(elapsed)
            .filter(|d| !d.is_zero())
    }

    pub fn admit(&mut self, now: Instant) -> Admission {
        self.refresh(now);
        match self.state {
            BreakerState::Closed => Admission::Normal,
            BreakerState::Open => {
                Admission::Wait(self.cooldown_remaining(now).unwrap_or(PROBE_POLL))
            }
            BreakerState::HalfOpen if self.probe_in_flight => Admission::Wait(PROBE_POLL),
            BreakerState::HalfOpen => {
                self.probe_in_flight = true;
                Admission::Probe
            }
        }
    }

    pub fn record_error(&mut self, now: Instant) {
        self.refresh(now);
        self.last_error = Some(now);
        self.push_error(now);
        match self.state {
            BreakerState::Closed => {
                if self.recent.len() > self.config.threshold as usize {
                    self.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.probe_in_flight = false;
            }
            // Errors from items already in flight restart the cool-down.
            BreakerState::Open => {}
        }
    }

    pub fn record_success(&mut self, now: Instant) {
        self.refresh(now);
        if self.state == BreakerState::HalfOpen && self.probe_in_flight {
            self.state = BreakerState::Closed;
            self.probe_in_flight = false;
            self.recent.clear();
        }
    }

    /// Give back a probe whose outcome says nothing about the backend
    /// (for example a repository skipped by preflight).
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }

    #[test]
    fn trips_only_after_exceeding_threshold() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..3 {
            breaker.record_error(t0 + Duration::from_secs(i));
        }
        assert_eq!(breaker.state(t0 + Duration::from_secs(3)), BreakerState::Closed);
        breaker.record_error(t0 + Duration::from_secs(4));
        assert_eq!(breaker.state(t0 + Duration::from_secs(4)), BreakerState::Open);
        assert!(matches!(
            breaker.admit(t0 + Duration::from_secs(5)),
            Admission::Wait(_)
        ));
    }

    #[test]
    fn errors_outside_window_do_not_accumulate() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..10u64 {
            breaker.record_error(t0 + Duration::from_secs(i * 61));
        }
        assert_eq!(
            breaker.state(t0 + Duration::from_secs(700)),
            BreakerState::Closed
        );
    }

    #[test]
    fn burst_straddling_a_minute_boundary_trips() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::new(config());
        for secs in [0, 58, 59, 61] {
            breaker.record_error(t0 + Duration::from_secs(secs));
        }
        // 0 has aged out; 58, 59 and 61 are three errors, still tolerated.
        assert_eq!(breaker.error_count(), 3);
        assert_eq!(breaker.state(t0 + Duration::from_secs(61)), BreakerState::Closed);
        breaker.record_error(t0 + Duration::from_secs(62));
        assert_eq!(breaker.state(t0 + Duration::from_secs(62)), BreakerState::Open);
    }

    #[test]
    fn success_after_probe_forgets_old_errors() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..4 {
            breaker.record_error(t0 + Duration::from_secs(i));
        }
        let after = t0 + Duration::from_secs(40);
        assert_eq!(breaker.admit(after), Admission::Probe);
        breaker.record_success(after);
        breaker.record_error(after + Duration::from_secs(1));
        assert_eq!(breaker.error_count(), 1);
        assert_eq!(breaker.state(after + Duration::from_secs(1)), BreakerState::Closed);
    }

    #[test]
    fn cooldown_half_opens_and_probe_success_closes() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..4 {
            breaker.record_error(t0 + Duration::from_secs(i));
        }
        let after = t0 + Duration::from_secs(3 + 30);
        assert_eq!(breaker.state(after), BreakerState::HalfOpen);
        assert_eq!(breaker.admit(after), Admission::Probe);
        assert_eq!(breaker.admit(after), Admission::Wait(PROBE_POLL));
        breaker.record_success(after);
        assert_eq!(breaker.state(after), BreakerState::Closed);
        assert_eq!(breaker.admit(after), Admission::Normal);
    }

    #[test]
    fn probe_failure_reopens() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..4 {
            breaker.record_error(t0 + Duration::from_secs(i));
        }
        let after = t0 + Duration::from_secs(40);
        assert_eq!(breaker.admit(after), Admission::Probe);
        breaker.record_error(after);
        assert_eq!(breaker.state(after), BreakerState::Open);
        assert_eq!(
            breaker.admit(after + Duration::from_secs(10)),
            Admission::Wait(Duration::from_secs(20))
        );
    }

    #[test]
    fn errors_while_open_restart_cooldown() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..4 {
            breaker.record_error(t0 + Duration::from_secs(i));
        }
        breaker.record_error(t0 + Duration::from_secs(25));
        assert_eq!(breaker.state(t0 + Duration::from_secs(40)), BreakerState::Open);
        assert_eq!(
            breaker.state(t0 + Duration::from_secs(55)),
            BreakerState::HalfOpen
        );
    }

    #[test]
    fn released_probe_can_be_taken_again() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..4 {
            breaker.record_error(t0 + Duration::from_secs(i));
        }
        let after = t0 + Duration::from_secs(40);
        assert_eq!(breaker.admit(after), Admission::Probe);
        breaker.release_probe();
        assert_eq!(breaker.admit(after), Admission::Probe);
    }
}
