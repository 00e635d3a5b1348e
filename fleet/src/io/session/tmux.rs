//! tmux-backed Session Driver.
//!
//! Each session is a detached tmux session on a private server socket
//! (`tmux -L <socket>`), named after the repository so a second live session
//! for the same repository is refused even across processes.

use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use super::{
    Activity, AgentErrorKind, Observation, Session, SessionDriver, SessionState, WaitCondition,
    WaitOutcome, chunk_message, single_line,
};
use crate::core::plan::{PLAN_BEGIN, PLAN_END, is_sentinel};
use crate::core::types::repo_slug;
use crate::error::{DriverError, DriverErrorCode};
use crate::io::config::AgentConfig;
use crate::io::process::{CommandOutput, find_executable, run_command_with_timeout};
use crate::io::signals::Interrupt;

const TMUX_TIMEOUT: Duration = Duration::from_secs(15);
const CAPTURE_LIMIT: usize = 8 * 1024 * 1024;
const HISTORY_LIMIT: &str = "100000";
/// Pause between chunks so the agent's input reader keeps up.
const CHUNK_PAUSE: Duration = Duration::from_millis(20);

/// A line the agent CLI prints for a failed request, optionally behind a
/// bullet glyph.
static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[^\w\s]{1,3}\s*)?(?:api error|error)\s*[:(]")
        .expect("error line pattern should be valid")
});

static RATE_SIGNAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(rate[ -]?limit(ed)?|too many requests|\b429\b|quota exceeded|overloaded_error)")
        .expect("rate signal pattern should be valid")
});

/// Banner printed instead of an error line when the subscription is exhausted.
static USAGE_BANNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[^\w\s]{1,3}\s*)?(?:claude )?usage limit reached")
        .expect("usage banner pattern should be valid")
});

/// True when agent output carries a rate-limit error line.
///
/// Only error-shaped lines count and plan blocks are skipped, so prose or
/// diffs that merely talk about rate limits are not a signal.
pub fn detect_rate_limit(text: &str) -> bool {
    outside_plan_blocks(text).any(|line| {
        USAGE_BANNER.is_match(line) || (ERROR_LINE.is_match(line) && RATE_SIGNAL.is_match(line))
    })
}

/// Lines of `text` outside sentinel plan blocks. An unclosed block hides
/// everything after its start.
fn outside_plan_blocks(text: &str) -> impl Iterator<Item = &str> {
    let mut in_plan = false;
    text.lines().filter(move |line| {
        if is_sentinel(line, PLAN_BEGIN) {
            in_plan = true;
            return false;
        }
        if in_plan {
            in_plan = !is_sentinel(line, PLAN_END);
            return false;
        }
        true
    })
}

#[derive(Debug, Clone)]
pub struct TmuxDriver {
    socket: String,
    command: Vec<String>,
    max_chunk_bytes: usize,
    poll: Duration,
}

impl TmuxDriver {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            socket: config.tmux_socket.clone(),
            command: config.command.clone(),
            max_chunk_bytes: config.max_chunk_bytes,
            poll: Duration::from_millis(config.poll_ms),
        }
    }

    fn tmux(&self, args: &[&str]) -> Result<CommandOutput, DriverError> {
        let mut cmd = Command::new("tmux");
        cmd.arg("-L").arg(&self.socket).args(args);
        let out = run_command_with_timeout(cmd, None, TMUX_TIMEOUT, CAPTURE_LIMIT).map_err(
            |err| DriverError::new(DriverErrorCode::DependencyMissing, format!("{err:#}")),
        )?;
        if out.timed_out {
            return Err(DriverError::new(
                DriverErrorCode::Timeout,
                format!("tmux {} timed out", args.first().unwrap_or(&"")),
            ));
        }
        Ok(out)
    }

    fn tmux_checked(&self, args: &[&str]) -> Result<String, DriverError> {
        let out = self.tmux(args)?;
        if !out.status.success() {
            let stderr = out.stderr_lossy();
            let code = if stderr.contains("can't find") || stderr.contains("no server running") {
                DriverErrorCode::NotFound
            } else {
                DriverErrorCode::Internal
            };
            return Err(DriverError::new(
                code,
                format!("tmux {}: {}", args.first().unwrap_or(&""), stderr.trim()),
            ));
        }
        Ok(out.stdout_lossy())
    }

    fn session_exists(&self, name: &str) -> bool {
        self.tmux(&["has-session", "-t", &exact(name)])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn live_sessions_with_prefix(&self, prefix: &str) -> Vec<String> {
        match self.tmux(&["list-sessions", "-F", "#{session_name}"]) {
            Ok(out) if out.status.success() => out
                .stdout_lossy()
                .lines()
                .filter(|name| name.starts_with(prefix))
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// `(dead, exit_status)` of the session's pane.
    fn pane_status(&self, session: &Session) -> Result<(bool, Option<i32>), DriverError> {
        let out = self.tmux_checked(&[
            "display-message",
            "-p",
            "-t",
            &exact(&session.id),
            "#{pane_dead} #{pane_dead_status}",
        ])?;
        let mut parts = out.split_whitespace();
        let dead = parts.next() == Some("1");
        let status = parts.next().and_then(|s| s.parse().ok());
        Ok((dead, status))
    }

    fn capture(&self, session: &Session) -> Result<String, DriverError> {
        self.tmux_checked(&["capture-pane", "-p", "-J", "-S", "-", "-t", &exact(&session.id)])
    }

    /// Sample output; returns (changed since last sample, bytes added).
    fn observe(&self, session: &mut Session) -> Result<(bool, usize, String), DriverError> {
        let text = self.capture(session)?;
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        let now = Instant::now();
        let (changed, added) = match &session.observation {
            Some(prev) if prev.digest == digest => (false, 0),
            Some(prev) => (true, text.len().saturating_sub(prev.len)),
            None => (true, text.len()),
        };
        let changed_at = match (&session.observation, changed) {
            (Some(prev), false) => prev.changed_at,
            _ => now,
        };
        session.observation = Some(Observation {
            digest,
            len: text.len(),
            changed_at,
            sampled_at: now,
        });
        Ok((changed, added, text))
    }
}

/// Target a session by exact name (no prefix matching).
fn exact(name: &str) -> String {
    format!("={name}")
}

fn session_prefix(workdir: &Path) -> String {
    format!("fleet-{}-", repo_slug(&workdir.display().to_string()))
}

impl SessionDriver for TmuxDriver {
    fn name(&self) -> &'static str {
        "tmux"
    }

    fn check_available(&self) -> Result<(), DriverError> {
        if find_executable("tmux").is_none() {
            return Err(DriverError::new(
                DriverErrorCode::DependencyMissing,
                "tmux not found on PATH",
            ));
        }
        let program = self.command.first().map(String::as_str).unwrap_or_default();
        if find_executable(program).is_none() {
            return Err(DriverError::new(
                DriverErrorCode::DependencyMissing,
                format!("agent command '{program}' not found on PATH"),
            ));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn spawn(&self, workdir: &Path, timeout: Duration) -> Result<Session, DriverError> {
        let prefix = session_prefix(workdir);
        let live = self.live_sessions_with_prefix(&prefix);
        if !live.is_empty() {
            return Err(DriverError::new(
                DriverErrorCode::Busy,
                format!("repository already has a live session: {}", live.join(", ")),
            ));
        }

        let id = format!("{prefix}{:08x}", rand::random::<u32>());
        let workdir_arg = workdir.display().to_string();
        let mut args: Vec<&str> = vec![
            "start-server",
            ";",
            "set-option",
            "-g",
            "history-limit",
            HISTORY_LIMIT,
            ";",
            "new-session",
            "-d",
            "-s",
            &id,
            "-x",
            "200",
            "-y",
            "50",
            "-c",
            &workdir_arg,
        ];
        args.extend(self.command.iter().map(String::as_str));
        args.extend([";", "set-option", "-t", &id, "remain-on-exit", "on"]);
        self.tmux_checked(&args)?;

        let mut session = Session::new(id, workdir);
        let deadline = Instant::now() + timeout;
        while !self.session_exists(&session.id) {
            if Instant::now() >= deadline {
                return Err(DriverError::new(
                    DriverErrorCode::Timeout,
                    format!("session {} did not start", session.id),
                ));
            }
            thread::sleep(self.poll.min(Duration::from_millis(100)));
        }
        session.state = SessionState::Active;
        debug!(session = %session.id, "session spawned");
        Ok(session)
    }

    fn send(&self, session: &mut Session, message: &str) -> Result<(), DriverError> {
        if !session.state.is_live() {
            return Err(DriverError::new(
                DriverErrorCode::NotFound,
                format!("session {} is not live", session.id),
            ));
        }
        let target = exact(&session.id);
        let line = single_line(message);
        for chunk in chunk_message(&line, self.max_chunk_bytes) {
            self.tmux_checked(&["send-keys", "-t", &target, "-l", "--", chunk])?;
            thread::sleep(CHUNK_PAUSE);
        }
        self.tmux_checked(&["send-keys", "-t", &target, "Enter"])?;
        session.state = SessionState::Active;
        Ok(())
    }

    #[instrument(skip_all, fields(session = %session.id, timeout_secs = timeout.as_secs()))]
    fn wait(
        &self,
        session: &mut Session,
        condition: WaitCondition,
        timeout: Duration,
        interrupt: &Interrupt,
    ) -> Result<WaitOutcome, DriverError> {
        let deadline = Instant::now() + timeout;
        let (_, _, baseline) = self.observe(session)?;
        let baseline_len = baseline.len();
        let mut changed_since_start = false;

        loop {
            if interrupt.is_set() {
                return Ok(WaitOutcome::Interrupted);
            }
            let (changed, _, text) = self.observe(session)?;
            changed_since_start |= changed;

            let fresh = text.get(baseline_len.min(text.len())..).unwrap_or(&text);
            if detect_rate_limit(fresh) {
                warn!(session = %session.id, "agent reported a rate limit");
                session.state = SessionState::Error;
                return Ok(WaitOutcome::AgentError(AgentErrorKind::RateLimited));
            }

            let (dead, status) = self.pane_status(session)?;
            if dead {
                if status.unwrap_or(0) != 0 {
                    session.state = SessionState::Error;
                    return Ok(WaitOutcome::AgentError(AgentErrorKind::Crashed));
                }
                session.state = SessionState::Done;
                return Ok(WaitOutcome::Met);
            }

            if let WaitCondition::Idle { quiet } = condition
                && changed_since_start
                && let Some(obs) = &session.observation
                && obs.changed_at.elapsed() >= quiet
            {
                session.state = SessionState::Idle;
                return Ok(WaitOutcome::Met);
            }

            if Instant::now() >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            if !interrupt.sleep(self.poll.min(deadline.saturating_duration_since(Instant::now()))) {
                return Ok(WaitOutcome::Interrupted);
            }
        }
    }

    fn activity(&self, session: &mut Session) -> Result<Activity, DriverError> {
        let previous = session.observation.as_ref().map(|o| o.sampled_at);
        let (changed, added, _) = self.observe(session)?;
        let velocity = match previous {
            Some(at) => {
                let secs = at.elapsed().as_secs_f64().max(f64::EPSILON);
                added as f64 / secs
            }
            None => 0.0,
        };
        if session.state.is_live() {
            session.state = if changed {
                SessionState::Active
            } else {
                SessionState::Idle
            };
        }
        Ok(Activity {
            state: session.state,
            velocity,
        })
    }

    fn transcript(&self, session: &Session) -> Result<String, DriverError> {
        self.capture(session)
    }

    fn kill(&self, session: &mut Session) -> Result<(), DriverError> {
        if session.state == SessionState::Killed {
            return Ok(());
        }
        if self.session_exists(&session.id) {
            self.tmux_checked(&["kill-session", "-t", &exact(&session.id)])?;
        }
        session.state = SessionState::Killed;
        debug!(session = %session.id, elapsed_ms = session.elapsed().as_millis() as u64, "session killed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_error_lines_are_detected() {
        assert!(detect_rate_limit("Error: 429 Too Many Requests"));
        assert!(detect_rate_limit("  ⎿  API Error: rate limit exceeded, retry later"));
        assert!(detect_rate_limit("API Error (overloaded_error)"));
        assert!(detect_rate_limit("Claude usage limit reached. Resets at 5pm"));
        assert!(!detect_rate_limit("Error: file not found"));
        assert!(!detect_rate_limit("Updated 4290 lines"));
        assert!(!detect_rate_limit("all good"));
    }

    #[test]
    fn prose_and_plans_about_rate_limits_are_not_signals() {
        let transcript = format!(
            "I'll add rate limiting to the API client.\n\
             The diff retries on HTTP 429 Too Many Requests.\n\
             {PLAN_BEGIN}\n\
             {{\"action\": \"commit\", \"message\": \"feat: add rate limit\"}}\n\
             Error: 429 in a quoted test fixture\n\
             {PLAN_END}\n\
             Done.\n"
        );
        assert!(!detect_rate_limit(&transcript));

        let unclosed = format!("{PLAN_BEGIN}\nError: rate limited while streaming\n");
        assert!(!detect_rate_limit(&unclosed));

        let after_plan = format!("{PLAN_BEGIN}\n{{}}\n{PLAN_END}\nAPI Error: 429 rate limited\n");
        assert!(detect_rate_limit(&after_plan));
    }

    #[test]
    fn session_names_share_a_per_repository_prefix() {
        let a = session_prefix(Path::new("/src/app"));
        let b = session_prefix(Path::new("/other/app"));
        assert!(a.starts_with("fleet-app-"));
        assert_ne!(a, b);
    }
}
