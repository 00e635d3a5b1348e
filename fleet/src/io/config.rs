//! Fleet configuration stored in `.fleet/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::BackoffPolicy;
use crate::core::breaker::BreakerConfig;
use crate::core::denylist::Denylist;
use crate::core::types::{ExecMode, PushPolicy, RepoOverrides, TaskKind};
use crate::io::atomic::write_atomic;
use crate::io::lock::LeaseConfig;

/// Fleet configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below;
/// command-line flags override file values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FleetConfig {
    /// Concurrent workers (1 = sequential).
    pub parallelism: usize,
    pub task: TaskKind,
    pub mode: ExecMode,
    pub push: PushPolicy,
    /// Where run state, ledger, plans and audit artifacts live.
    pub state_dir: PathBuf,
    pub agent: AgentConfig,
    pub timeouts: TimeoutConfig,
    pub preflight: PreflightConfig,
    pub guardrails: GuardrailConfig,
    pub governor: GovernorConfig,
    pub lock: LockConfig,
    /// Per-repository overrides (`[[repo]]` tables).
    #[serde(rename = "repo", skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<RepoEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command line started inside each session.
    pub command: Vec<String>,
    /// tmux server socket name (`tmux -L`), isolating fleet sessions.
    pub tmux_socket: String,
    /// Messages longer than this are sent in several chunks.
    pub max_chunk_bytes: usize,
    /// Pane output unchanged for this long counts as idle.
    pub idle_quiet_secs: u64,
    pub poll_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            tmux_socket: "fleet".to_string(),
            max_chunk_bytes: 2048,
            idle_quiet_secs: 5,
            poll_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub spawn_secs: u64,
    pub planning_secs: u64,
    pub validating_secs: u64,
    pub executing_secs: u64,
    /// Per git subprocess (push included).
    pub git_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            spawn_secs: 30,
            planning_secs: 15 * 60,
            validating_secs: 120,
            executing_secs: 300,
            git_secs: 120,
        }
    }
}

impl TimeoutConfig {
    pub fn spawn(&self) -> Duration {
        Duration::from_secs(self.spawn_secs)
    }

    pub fn planning(&self) -> Duration {
        Duration::from_secs(self.planning_secs)
    }

    pub fn validating(&self) -> Duration {
        Duration::from_secs(self.validating_secs)
    }

    pub fn executing(&self) -> Duration {
        Duration::from_secs(self.executing_secs)
    }

    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreflightConfig {
    pub max_untracked: usize,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self { max_untracked: 200 }
    }
}

/// What happens to denylisted paths in an otherwise valid plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenylistMode {
    /// Any denylisted path rejects the whole plan.
    Reject,
    /// Drop denylisted paths; reject only when nothing remains.
    Strip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretScannerMode {
    /// Use `gitleaks` when installed, heuristics otherwise.
    Auto,
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardrailConfig {
    pub denylist: Vec<String>,
    pub denylist_mode: DenylistMode,
    pub max_file_bytes: u64,
    /// Globs of binary files that may be committed.
    pub allow_binary: Vec<String>,
    /// Globs of files exempt from `max_file_bytes`.
    pub allow_large: Vec<String>,
    pub secret_scanner: SecretScannerMode,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            denylist: Denylist::default_patterns(),
            denylist_mode: DenylistMode::Reject,
            max_file_bytes: 1024 * 1024,
            allow_binary: Vec::new(),
            allow_large: Vec::new(),
            secret_scanner: SecretScannerMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GovernorConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub breaker_threshold: u32,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 30,
            max_delay_secs: 15 * 60,
            breaker_threshold: 5,
            breaker_window_secs: 5 * 60,
            breaker_cooldown_secs: 2 * 60,
        }
    }
}

impl GovernorConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.breaker_threshold,
            window: Duration::from_secs(self.breaker_window_secs),
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_ms: u64,
    pub stale_secs: u64,
    pub poll_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            stale_secs: 120,
            poll_ms: 25,
        }
    }
}

impl LockConfig {
    /// Lease settings for the short-lived shared-resource locks.
    pub fn shared(&self) -> LeaseConfig {
        LeaseConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            stale_after: Some(Duration::from_secs(self.stale_secs)),
            poll: Duration::from_millis(self.poll_ms),
        }
    }
}

/// One `[[repo]]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoEntry {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_untracked: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushPolicy>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            task: TaskKind::Commit,
            mode: ExecMode::Full,
            push: PushPolicy::None,
            state_dir: PathBuf::from(".fleet"),
            agent: AgentConfig::default(),
            timeouts: TimeoutConfig::default(),
            preflight: PreflightConfig::default(),
            guardrails: GuardrailConfig::default(),
            governor: GovernorConfig::default(),
            lock: LockConfig::default(),
            repos: Vec::new(),
        }
    }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(anyhow!("parallelism must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.max_chunk_bytes == 0 {
            return Err(anyhow!("agent.max_chunk_bytes must be > 0"));
        }
        if self.agent.poll_ms == 0 {
            return Err(anyhow!("agent.poll_ms must be > 0"));
        }
        let t = &self.timeouts;
        for (name, value) in [
            ("spawn_secs", t.spawn_secs),
            ("planning_secs", t.planning_secs),
            ("validating_secs", t.validating_secs),
            ("executing_secs", t.executing_secs),
            ("git_secs", t.git_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("timeouts.{name} must be > 0"));
            }
        }
        if self.guardrails.max_file_bytes == 0 {
            return Err(anyhow!("guardrails.max_file_bytes must be > 0"));
        }
        Denylist::new(&self.guardrails.denylist).context("guardrails.denylist")?;
        let g = &self.governor;
        if g.base_delay_secs == 0 || g.max_delay_secs < g.base_delay_secs {
            return Err(anyhow!(
                "governor delays must satisfy 0 < base_delay_secs <= max_delay_secs"
            ));
        }
        if g.breaker_window_secs == 0 || g.breaker_cooldown_secs == 0 {
            return Err(anyhow!("governor breaker window and cooldown must be > 0"));
        }
        if self.lock.timeout_ms == 0 || self.lock.poll_ms == 0 || self.lock.stale_secs == 0 {
            return Err(anyhow!("lock timeout_ms, poll_ms and stale_secs must be > 0"));
        }
        Ok(())
    }

    /// `[[repo]]` entry matching a canonical repository path, if any.
    pub fn repo_entry(&self, canonical: &Path) -> Option<&RepoEntry> {
        self.repos.iter().find(|entry| {
            entry.path == canonical
                || fs::canonicalize(&entry.path)
                    .map(|p| p == canonical)
                    .unwrap_or(false)
        })
    }

    pub fn overrides_for(&self, canonical: &Path) -> (Option<String>, RepoOverrides) {
        match self.repo_entry(canonical) {
            Some(entry) => (
                entry.upstream.clone(),
                RepoOverrides {
                    max_untracked: entry.max_untracked,
                    push: entry.push,
                },
            ),
            None => (None, RepoOverrides::default()),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FleetConfig::default()`.
pub fn load_config(path: &Path) -> Result<FleetConfig> {
    if !path.exists() {
        let cfg = FleetConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FleetConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FleetConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
