//! Session Driver abstraction over an external agent process.
//!
//! A [`Session`] is owned by exactly one worker; calls against it are never
//! issued concurrently. Activity and idle detection only time phase
//! boundaries; they are never evidence that a plan is correct.

pub mod tmux;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::DriverError;
use crate::io::signals::Interrupt;

/// Lifecycle of one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Spawning,
    Active,
    Idle,
    Done,
    Error,
    Killed,
}

impl SessionState {
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Spawning | SessionState::Active | SessionState::Idle
        )
    }
}

/// Last output sample, used for idle detection and velocity.
#[derive(Debug, Clone)]
pub struct Observation {
    pub digest: String,
    pub len: usize,
    pub changed_at: Instant,
    pub sampled_at: Instant,
}

/// Handle to one agent process bound to one repository.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub workdir: PathBuf,
    pub state: SessionState,
    pub started_at: Instant,
    pub observation: Option<Observation>,
}

impl Session {
    pub fn new(id: impl Into<String>, workdir: &Path) -> Self {
        Self {
            id: id.into(),
            workdir: workdir.to_path_buf(),
            state: SessionState::Spawning,
            started_at: Instant::now(),
            observation: None,
        }
    }

    /// Accumulated wall-clock duration.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Output changed after the wait began, then stayed unchanged for `quiet`
    /// (or the agent exited).
    Idle { quiet: Duration },
    /// The agent process exited.
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    RateLimited,
    /// The agent exited with a failure status.
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Met,
    TimedOut,
    AgentError(AgentErrorKind),
    Interrupted,
}

/// Progress report; never used for correctness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Activity {
    pub state: SessionState,
    /// Output bytes per second since the previous sample.
    pub velocity: f64,
}

/// Backend-polymorphic session operations.
pub trait SessionDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probe that the backend and the agent command can be used at all.
    fn check_available(&self) -> Result<(), DriverError>;

    fn spawn(&self, workdir: &Path, timeout: Duration) -> Result<Session, DriverError>;

    /// Deliver `message` as one line of input, chunked as the transport needs.
    fn send(&self, session: &mut Session, message: &str) -> Result<(), DriverError>;

    fn wait(
        &self,
        session: &mut Session,
        condition: WaitCondition,
        timeout: Duration,
        interrupt: &Interrupt,
    ) -> Result<WaitOutcome, DriverError>;

    fn activity(&self, session: &mut Session) -> Result<Activity, DriverError>;

    /// Full captured output of the session.
    fn transcript(&self, session: &Session) -> Result<String, DriverError>;

    /// Terminate the session. Idempotent.
    fn kill(&self, session: &mut Session) -> Result<(), DriverError>;
}

/// Owns a live session and kills it when dropped.
pub struct SessionGuard<'a> {
    driver: &'a dyn SessionDriver,
    session: Session,
}

impl<'a> SessionGuard<'a> {
    pub fn new(driver: &'a dyn SessionDriver, session: Session) -> Self {
        Self { driver, session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Kill now and report the result.
    pub fn kill(&mut self) -> Result<(), DriverError> {
        self.driver.kill(&mut self.session)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.session.state == SessionState::Killed {
            return;
        }
        if let Err(err) = self.driver.kill(&mut self.session) {
            warn!(session = %self.session.id, err = %err, "failed to kill session");
        }
    }
}

/// Split `message` into pieces of at most `max_bytes`, on char boundaries.
pub fn chunk_message(message: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(4);
    let mut chunks = Vec::new();
    let mut rest = message;
    while !rest.is_empty() {
        if rest.len() <= max_bytes {
            chunks.push(rest);
            break;
        }
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// Collapse line breaks so a multi-line prompt is submitted as one input.
pub fn single_line(message: &str) -> String {
    message
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
