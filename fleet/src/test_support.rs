//! Fixtures for tests: throwaway git repositories and a scripted agent.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tempfile::TempDir;

use crate::core::plan::{PLAN_BEGIN, PLAN_END};
use crate::error::{DriverError, DriverErrorCode};
use crate::io::config::{FleetConfig, SecretScannerMode};
use crate::io::session::{
    Activity, AgentErrorKind, Session, SessionDriver, SessionState, WaitCondition, WaitOutcome,
    single_line,
};
use crate::io::signals::Interrupt;

/// A git repository with one commit on `main` and a bare `origin` it tracks.
pub struct TestRepo {
    _temp: Option<TempDir>,
    path: PathBuf,
    upstream: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let mut repo = Self::in_dir(temp.path(), "repo")?;
        repo._temp = Some(temp);
        Ok(repo)
    }

    /// Create `parent/name` plus `parent/name-upstream.git`.
    pub fn in_dir(parent: &Path, name: &str) -> Result<Self> {
        let path = parent.join(name);
        let upstream = parent.join(format!("{name}-upstream.git"));
        fs::create_dir_all(&path).with_context(|| format!("mkdir {}", path.display()))?;
        let path = path.canonicalize().context("canonicalize repo")?;

        git_in(&path, &["init", "-q", "--initial-branch=main"])?;
        git_in(&path, &["config", "user.name", "Fleet Test"])?;
        git_in(&path, &["config", "user.email", "fleet@example.com"])?;
        git_in(&path, &["config", "commit.gpgsign", "false"])?;
        git_in(&path, &["config", "tag.gpgsign", "false"])?;
        fs::write(path.join("README.md"), format!("# {name}\n")).context("write README")?;
        git_in(&path, &["add", "README.md"])?;
        git_in(&path, &["commit", "-q", "-m", "initial"])?;

        let upstream_str = upstream.to_string_lossy().into_owned();
        git_in(parent, &["init", "-q", "--bare", &upstream_str])?;
        git_in(&path, &["remote", "add", "origin", &upstream_str])?;
        git_in(&path, &["push", "-q", "-u", "origin", "main"])?;

        Ok(Self {
            _temp: None,
            path,
            upstream,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn upstream(&self) -> &Path {
        &self.upstream
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let file = self.path.join(rel);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&file, contents).with_context(|| format!("write {}", file.display()))
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        git_in(&self.path, args)
    }

    /// Leave the repository looking like a merge stopped on conflicts.
    pub fn simulate_merge_in_progress(&self) -> Result<()> {
        let head = self.head()?;
        let git_dir = self.git(&["rev-parse", "--absolute-git-dir"])?;
        fs::write(Path::new(&git_dir).join("MERGE_HEAD"), format!("{head}\n"))
            .context("write MERGE_HEAD")
    }

    pub fn head(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn commit_count(&self) -> Result<usize> {
        Ok(self.git(&["rev-list", "--count", "HEAD"])?.parse()?)
    }

    /// Subject of the newest commit.
    pub fn last_subject(&self) -> Result<String> {
        self.git(&["log", "-1", "--format=%s"])
    }

    /// Commit the upstream has for `main`.
    pub fn upstream_head(&self) -> Result<String> {
        git_in(&self.upstream, &["rev-parse", "main"])
    }
}

fn git_in(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .with_context(|| format!("spawn git {args:?}"))?;
    if !output.status.success() {
        bail!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Config tuned for tests: heuristic scanning, short waits.
pub fn test_config(state_dir: &Path) -> FleetConfig {
    let mut config = FleetConfig {
        state_dir: state_dir.to_path_buf(),
        ..FleetConfig::default()
    };
    config.guardrails.secret_scanner = SecretScannerMode::Heuristic;
    config.agent.idle_quiet_secs = 0;
    config.timeouts.spawn_secs = 5;
    config.timeouts.planning_secs = 10;
    config.timeouts.validating_secs = 30;
    config.timeouts.executing_secs = 30;
    config.timeouts.git_secs = 30;
    config.lock.timeout_ms = 5_000;
    config.lock.poll_ms = 5;
    config.governor.base_delay_secs = 1;
    config.governor.max_delay_secs = 2;
    config
}

/// JSON for a commit plan staging `paths`.
pub fn commit_plan(message: &str, paths: &[&str]) -> String {
    let files: Vec<_> = paths
        .iter()
        .map(|p| json!({ "path": p, "op": "stage" }))
        .collect();
    json!({
        "schema_version": 1,
        "action": "commit",
        "message": message,
        "files": files,
        "rationale": "scripted",
    })
    .to_string()
}

/// JSON for a release plan creating `tag`.
pub fn release_plan(tag: &str, message: &str) -> String {
    json!({
        "schema_version": 1,
        "action": "release",
        "tag": tag,
        "message": message,
    })
    .to_string()
}

#[derive(Debug, Clone)]
pub enum Reply {
    /// Agent output after the echoed prompt; the wait succeeds.
    Transcript(String),
    RateLimited,
    Timeout,
    Crash,
}

/// What the scripted agent does in one repository.
#[derive(Debug, Clone)]
pub struct Script {
    reply: Reply,
    delay: Duration,
    writes: Vec<(String, String)>,
    interrupt: Option<Interrupt>,
}

impl Script {
    pub fn reply(reply: Reply) -> Self {
        Self {
            reply,
            delay: Duration::ZERO,
            writes: Vec::new(),
            interrupt: None,
        }
    }

    /// Reply with `json` wrapped in plan sentinels.
    pub fn plan(json: &str) -> Self {
        Self::reply(Reply::Transcript(format!(
            "Looking at the changes.\n{PLAN_BEGIN}\n{json}\n{PLAN_END}\nDone.\n"
        )))
    }

    /// Think for `delay` before replying.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Write a file into the working tree while planning.
    pub fn writing(mut self, rel: &str, contents: &str) -> Self {
        self.writes.push((rel.to_string(), contents.to_string()));
        self
    }

    /// Fire `interrupt` while waiting, as a Ctrl-C would.
    pub fn interrupting(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }
}

#[derive(Debug, Default)]
struct Inner {
    scripts: HashMap<PathBuf, Script>,
    live: HashMap<PathBuf, usize>,
    max_live_per_repo: usize,
    live_total: usize,
    max_live_total: usize,
    spawns: HashMap<PathBuf, usize>,
    prompts: HashMap<String, String>,
    next_id: usize,
}

/// In-process [`SessionDriver`] that replays canned agent behavior.
#[derive(Debug)]
pub struct ScriptedDriver {
    available: bool,
    fallback: Script,
    inner: Mutex<Inner>,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    /// Every repository gets a reply without a plan block.
    pub fn new() -> Self {
        Self {
            available: true,
            fallback: Script::reply(Reply::Transcript("I have no plan.\n".into())),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Fail the availability probe, like a missing agent binary.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_fallback(mut self, script: Script) -> Self {
        self.fallback = script;
        self
    }

    pub fn with_script(self, repo: &Path, script: Script) -> Self {
        self.lock().scripts.insert(canonical(repo), script);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn script_for(&self, workdir: &Path) -> Script {
        self.lock()
            .scripts
            .get(workdir)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn spawn_count(&self, repo: &Path) -> usize {
        self.lock().spawns.get(&canonical(repo)).copied().unwrap_or(0)
    }

    pub fn total_spawns(&self) -> usize {
        self.lock().spawns.values().sum()
    }

    /// Most sessions ever live at once for a single repository.
    pub fn max_live_per_repo(&self) -> usize {
        self.lock().max_live_per_repo
    }

    /// Most sessions ever live at once overall.
    pub fn max_live_total(&self) -> usize {
        self.lock().max_live_total
    }

    pub fn live_sessions(&self) -> usize {
        self.lock().live_total
    }

    /// Prompts sent, in no particular order.
    pub fn prompts(&self) -> Vec<String> {
        self.lock().prompts.values().cloned().collect()
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

impl SessionDriver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn check_available(&self) -> Result<(), DriverError> {
        if self.available {
            Ok(())
        } else {
            Err(DriverError::new(
                DriverErrorCode::DependencyMissing,
                "scripted agent is unavailable",
            ))
        }
    }

    fn spawn(&self, workdir: &Path, _timeout: Duration) -> Result<Session, DriverError> {
        let workdir = canonical(workdir);
        let mut inner = self.lock();
        let live = inner.live.entry(workdir.clone()).or_default();
        *live += 1;
        let now = *live;
        inner.max_live_per_repo = inner.max_live_per_repo.max(now);
        if now > 1 {
            if let Some(live) = inner.live.get_mut(&workdir) {
                *live -= 1;
            }
            return Err(DriverError::new(
                DriverErrorCode::Busy,
                format!("{} already has a live session", workdir.display()),
            ));
        }
        inner.live_total += 1;
        inner.max_live_total = inner.max_live_total.max(inner.live_total);
        *inner.spawns.entry(workdir.clone()).or_default() += 1;
        inner.next_id += 1;
        let mut session = Session::new(format!("scripted-{}", inner.next_id), &workdir);
        session.state = SessionState::Active;
        Ok(session)
    }

    fn send(&self, session: &mut Session, message: &str) -> Result<(), DriverError> {
        if !session.state.is_live() {
            return Err(DriverError::new(DriverErrorCode::NotFound, "session is gone"));
        }
        self.lock()
            .prompts
            .insert(session.id.clone(), single_line(message));
        Ok(())
    }

    fn wait(
        &self,
        session: &mut Session,
        _condition: WaitCondition,
        _timeout: Duration,
        interrupt: &Interrupt,
    ) -> Result<WaitOutcome, DriverError> {
        let script = self.script_for(&session.workdir);
        for (rel, contents) in &script.writes {
            let file = session.workdir.join(rel);
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| DriverError::new(DriverErrorCode::Internal, e.to_string()))?;
            }
            fs::write(&file, contents)
                .map_err(|e| DriverError::new(DriverErrorCode::Internal, e.to_string()))?;
        }
        if let Some(trigger) = &script.interrupt {
            trigger.trigger();
        }
        if !interrupt.sleep(script.delay) || interrupt.is_set() {
            return Ok(WaitOutcome::Interrupted);
        }
        let outcome = match script.reply {
            Reply::Transcript(_) => {
                session.state = SessionState::Idle;
                WaitOutcome::Met
            }
            Reply::RateLimited => {
                session.state = SessionState::Error;
                WaitOutcome::AgentError(AgentErrorKind::RateLimited)
            }
            Reply::Timeout => WaitOutcome::TimedOut,
            Reply::Crash => {
                session.state = SessionState::Done;
                WaitOutcome::AgentError(AgentErrorKind::Crashed)
            }
        };
        Ok(outcome)
    }

    fn activity(&self, session: &mut Session) -> Result<Activity, DriverError> {
        Ok(Activity {
            state: session.state,
            velocity: 0.0,
        })
    }

    fn transcript(&self, session: &Session) -> Result<String, DriverError> {
        let prompt = self
            .lock()
            .prompts
            .get(&session.id)
            .cloned()
            .unwrap_or_default();
        let reply = match self.script_for(&session.workdir).reply {
            Reply::Transcript(text) => text,
            Reply::RateLimited => "Error: 429 rate limit exceeded\n".into(),
            Reply::Timeout => String::new(),
            Reply::Crash => "panic: agent crashed\n".into(),
        };
        Ok(format!("> {prompt}\n{reply}"))
    }

    fn kill(&self, session: &mut Session) -> Result<(), DriverError> {
        if session.state == SessionState::Killed {
            return Ok(());
        }
        let mut inner = self.lock();
        if let Some(live) = inner.live.get_mut(&session.workdir) {
            *live = live.saturating_sub(1);
        }
        inner.live_total = inner.live_total.saturating_sub(1);
        session.state = SessionState::Killed;
        Ok(())
    }
}
