//! Git adapter for the orchestrator.
//!
//! The orchestrator, never the agent, performs every git mutation, so we keep
//! a small, explicit wrapper around `git` subprocess calls. Commits are built
//! in a private index so a failure partway through never disturbs the
//! caller's staging area or working tree.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::core::plan::{FileOp, FileOpKind};
use crate::core::preflight::RepoSnapshot;
use crate::io::atomic::remove_if_exists;
use crate::io::process::{CommandOutput, DEFAULT_OUTPUT_LIMIT, run_command_with_timeout};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Porcelain codes that mean an unresolved merge conflict.
const CONFLICT_CODES: &[&str] = &["DD", "AU", "UD", "UA", "DU", "AA", "UU"];

/// Parsed `git status --porcelain -z` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }

    pub fn is_conflict(&self) -> bool {
        CONFLICT_CODES.contains(&self.code.as_str())
    }
}

/// Where a branch pushes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub remote: String,
    /// Full destination ref, e.g. `refs/heads/main`.
    pub merge_ref: String,
}

/// Result of an isolated commit, kept for rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub branch: String,
    /// Branch tip before the commit; `None` for an unborn branch.
    pub previous: Option<String>,
    pub new_oid: String,
    pub paths: Vec<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the workdir is inside a non-bare work tree.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.success() && out.stdout_lossy().trim() == "true")
            .unwrap_or(false)
    }

    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    pub fn git_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Resolve a path inside the git directory (`rev-parse --git-path`).
    pub fn git_path(&self, name: &str) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-path", name])?;
        let path = PathBuf::from(out.trim());
        Ok(if path.is_absolute() {
            path
        } else {
            self.workdir.join(path)
        })
    }

    /// Current branch name, or `None` on detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run(&["symbolic-ref", "-q", "--short", "HEAD"])?;
        if out.success() {
            let name = out.stdout_lossy().trim().to_string();
            debug!(branch = %name, "current branch");
            return Ok(Some(name));
        }
        if out.status.code() == Some(1) {
            return Ok(None);
        }
        Err(anyhow!(
            "git symbolic-ref failed: {}",
            out.stderr_lossy().trim()
        ))
    }

    /// Tracking ref of the current branch (e.g. `origin/main`), if configured.
    pub fn upstream(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"])?;
        if !out.success() {
            return Ok(None);
        }
        let name = out.stdout_lossy().trim().to_string();
        Ok((!name.is_empty()).then_some(name))
    }

    /// Commits only on HEAD and only on upstream.
    pub fn ahead_behind(&self) -> Result<(usize, usize)> {
        let out = self.run_capture(&["rev-list", "--left-right", "--count", "HEAD...@{u}"])?;
        parse_ahead_behind(&out)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-z", "-uall"])?;
        parse_status_z(&out)
    }

    /// Gather the facts preflight needs.
    #[instrument(skip_all, fields(repo = %self.workdir.display()))]
    pub fn snapshot(&self) -> Result<RepoSnapshot> {
        let exists = |name: &str| -> Result<bool> { Ok(self.git_path(name)?.exists()) };
        let merge_in_progress = exists("MERGE_HEAD")?;
        let rebase_in_progress = exists("rebase-merge")? || exists("rebase-apply")?;
        let cherry_pick_in_progress = exists("CHERRY_PICK_HEAD")?;
        let branch = self.current_branch()?;
        let upstream = match branch {
            Some(_) => self.upstream()?,
            None => None,
        };
        let (ahead, behind) = match upstream {
            Some(_) => self.ahead_behind()?,
            None => (0, 0),
        };
        let status = self.status_porcelain()?;
        let snapshot = RepoSnapshot {
            merge_in_progress,
            rebase_in_progress,
            cherry_pick_in_progress,
            branch,
            upstream,
            ahead,
            behind,
            conflicted: status.iter().filter(|e| e.is_conflict()).count(),
            untracked: status.iter().filter(|e| e.is_untracked()).count(),
        };
        debug!(?snapshot, "repository snapshot");
        Ok(snapshot)
    }

    /// HEAD commit id, or `None` on an unborn branch.
    pub fn head_oid(&self) -> Result<Option<String>> {
        self.resolve("HEAD")
    }

    fn resolve(&self, rev: &str) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "-q", "--verify", rev])?;
        if out.success() {
            return Ok(Some(out.stdout_lossy().trim().to_string()));
        }
        Ok(None)
    }

    /// Hash of HEAD, the index tree, working-tree status, and the content of
    /// every changed or untracked file.
    ///
    /// Any concurrent modification of the repository changes the value.
    #[instrument(skip_all, fields(repo = %self.workdir.display()))]
    pub fn fingerprint(&self) -> Result<String> {
        let head = self.head_oid()?.unwrap_or_else(|| "unborn".to_string());
        let tree = self.run_capture(&["write-tree"])?;
        let status = self.run_capture(&["status", "--porcelain=v1", "-z", "-uall"])?;
        let mut hasher = Sha256::new();
        hasher.update(head.as_bytes());
        hasher.update(b"\n");
        hasher.update(tree.trim().as_bytes());
        hasher.update(b"\n");
        hasher.update(status.as_bytes());
        for entry in parse_status_z(&status)? {
            // Re-editing an already modified file leaves the status line unchanged.
            if let Ok(bytes) = fs::read(self.workdir.join(&entry.path)) {
                hasher.update(entry.path.as_bytes());
                hasher.update(Sha256::digest(&bytes));
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Commit exactly `files` onto `branch` without touching the caller's index.
    ///
    /// The tree is built in a private index seeded from HEAD; the branch is
    /// moved with a compare-and-swap so a concurrent commit is detected.
    /// Afterwards the real index entries of the touched paths are synced to
    /// the new HEAD.
    #[instrument(skip_all, fields(repo = %self.workdir.display(), branch, files = files.len()))]
    pub fn commit_files(
        &self,
        branch: &str,
        message: &str,
        files: &[FileOp],
    ) -> Result<CommitRecord> {
        if files.is_empty() {
            bail!("refusing to commit an empty file list");
        }
        let current = self.current_branch()?;
        if current.as_deref() != Some(branch) {
            bail!(
                "HEAD is on {:?}, expected branch '{branch}'",
                current.unwrap_or_else(|| "detached HEAD".into())
            );
        }
        let previous = self.head_oid()?;
        let index = self
            .git_dir()?
            .join(format!("fleet-index-{:08x}", rand::random::<u32>()));
        let result = self.build_commit(&index, previous.as_deref(), message, files);
        if let Err(err) = remove_if_exists(&index) {
            warn!(err = %err, "failed to remove private index");
        }
        let new_oid = result?;

        let reference = format!("refs/heads/{branch}");
        let old = previous.clone().unwrap_or_default();
        self.run_checked(&[
            "update-ref",
            "-m",
            "fleet: commit",
            &reference,
            &new_oid,
            &old,
        ])?;

        let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
        self.sync_index(&paths);
        debug!(new_oid = %new_oid, "commit created");
        Ok(CommitRecord {
            branch: branch.to_string(),
            previous,
            new_oid,
            paths,
        })
    }

    fn build_commit(
        &self,
        index: &Path,
        parent: Option<&str>,
        message: &str,
        files: &[FileOp],
    ) -> Result<String> {
        let env = [("GIT_INDEX_FILE", index.as_os_str())];
        match parent {
            Some(oid) => self.run_checked_env(&["read-tree", oid], &env)?,
            None => self.run_checked_env(&["read-tree", "--empty"], &env)?,
        };
        for op in files {
            match op.op {
                FileOpKind::Stage => {
                    self.run_checked_env(&["add", "--", &op.path], &env)?;
                }
                FileOpKind::Remove => {
                    self.run_checked_env(
                        &["rm", "--cached", "--ignore-unmatch", "-q", "--", &op.path],
                        &env,
                    )?;
                }
            }
        }
        let tree = self.capture_env(&["write-tree"], &env)?;
        let tree = tree.trim();
        if let Some(oid) = parent {
            let parent_tree = self.run_capture(&["rev-parse", &format!("{oid}^{{tree}}")])?;
            if parent_tree.trim() == tree {
                bail!("plan produces no changes relative to HEAD");
            }
        }
        let mut args = vec!["commit-tree", tree];
        if let Some(oid) = parent {
            args.extend(["-p", oid]);
        }
        args.extend(["-m", message]);
        let oid = self.run_capture(&args)?;
        Ok(oid.trim().to_string())
    }

    /// Move the index entries of `paths` to match HEAD. Best effort.
    fn sync_index(&self, paths: &[String]) {
        let mut args = vec!["reset", "-q", "--"];
        args.extend(paths.iter().map(String::as_str));
        if let Err(err) = self.run_checked(&args) {
            warn!(err = %err, "failed to sync index after ref update");
        }
    }

    /// Undo [`Git::commit_files`] if the branch still points at the new commit.
    #[instrument(skip_all, fields(repo = %self.workdir.display(), branch = %record.branch))]
    pub fn rollback_commit(&self, record: &CommitRecord) -> Result<()> {
        let reference = format!("refs/heads/{}", record.branch);
        match &record.previous {
            Some(previous) => self.run_checked(&[
                "update-ref",
                "-m",
                "fleet: rollback",
                &reference,
                previous,
                &record.new_oid,
            ])?,
            None => self.run_checked(&["update-ref", "-d", &reference, &record.new_oid])?,
        };
        if record.previous.is_some() {
            self.sync_index(&record.paths);
        }
        warn!(new_oid = %record.new_oid, "commit rolled back");
        Ok(())
    }

    /// Most recent tag reachable from HEAD.
    pub fn latest_tag(&self) -> Result<Option<String>> {
        let out = self.run(&["describe", "--tags", "--abbrev=0"])?;
        if out.success() {
            return Ok(Some(out.stdout_lossy().trim().to_string()));
        }
        Ok(None)
    }

    pub fn tag_exists(&self, tag: &str) -> Result<bool> {
        Ok(self.resolve(&format!("refs/tags/{tag}"))?.is_some())
    }

    /// Create an annotated tag at HEAD. Returns the tag object id.
    #[instrument(skip_all, fields(repo = %self.workdir.display(), tag))]
    pub fn create_tag(&self, tag: &str, message: &str) -> Result<String> {
        self.run_checked(&["check-ref-format", &format!("refs/tags/{tag}")])
            .with_context(|| format!("invalid tag name '{tag}'"))?;
        if self.tag_exists(tag)? {
            bail!("tag '{tag}' already exists");
        }
        self.run_checked(&["tag", "-a", tag, "-m", message])?;
        let oid = self
            .resolve(&format!("refs/tags/{tag}"))?
            .ok_or_else(|| anyhow!("tag '{tag}' missing after creation"))?;
        Ok(oid)
    }

    pub fn delete_tag(&self, tag: &str) -> Result<()> {
        self.run_checked(&["tag", "-d", tag])?;
        warn!(tag, "tag rolled back");
        Ok(())
    }

    /// Remote and destination ref for `branch`, honouring a remote override.
    pub fn push_target(&self, branch: &str, remote_override: Option<&str>) -> Result<PushTarget> {
        let remote = match remote_override {
            Some(remote) => remote.to_string(),
            None => self
                .config_get(&format!("branch.{branch}.remote"))?
                .ok_or_else(|| anyhow!("branch '{branch}' has no upstream remote"))?,
        };
        let merge_ref = self
            .config_get(&format!("branch.{branch}.merge"))?
            .unwrap_or_else(|| format!("refs/heads/{branch}"));
        Ok(PushTarget { remote, merge_ref })
    }

    fn config_get(&self, key: &str) -> Result<Option<String>> {
        let out = self.run(&["config", "--get", key])?;
        if out.success() {
            return Ok(Some(out.stdout_lossy().trim().to_string()));
        }
        Ok(None)
    }

    #[instrument(skip_all, fields(repo = %self.workdir.display(), remote = %target.remote))]
    pub fn push_branch(&self, branch: &str, target: &PushTarget) -> Result<()> {
        let refspec = format!("refs/heads/{branch}:{}", target.merge_ref);
        self.run_checked(&["push", "--porcelain", &target.remote, &refspec])?;
        Ok(())
    }

    #[instrument(skip_all, fields(repo = %self.workdir.display(), remote))]
    pub fn push_tag(&self, remote: &str, tag: &str) -> Result<()> {
        let refspec = format!("refs/tags/{tag}");
        self.run_checked(&["push", "--porcelain", remote, &refspec])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_lossy())
    }

    fn capture_env(&self, args: &[&str], env: &[(&str, &OsStr)]) -> Result<String> {
        let output = self.run_checked_env(args, env)?;
        Ok(output.stdout_lossy())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        self.run_checked_env(args, &[])
    }

    fn run_checked_env(&self, args: &[&str], env: &[(&str, &OsStr)]) -> Result<CommandOutput> {
        let output = self.run_env(args, env)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        self.run_env(args, &[])
    }

    fn run_env(&self, args: &[&str], env: &[(&str, &OsStr)]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            // Plan paths are file names, never glob or magic pathspecs.
            .env("GIT_LITERAL_PATHSPECS", "1")
            .env("LC_ALL", "C");
        for (key, value) in env {
            cmd.env(key, value);
        }
        run_command_with_timeout(cmd, None, self.timeout, DEFAULT_OUTPUT_LIMIT)
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_ahead_behind(out: &str) -> Result<(usize, usize)> {
    let mut parts = out.split_whitespace();
    let (Some(ahead), Some(behind)) = (parts.next(), parts.next()) else {
        return Err(anyhow!("unexpected rev-list output: '{}'", out.trim()));
    };
    Ok((
        ahead.parse().context("parse ahead count")?,
        behind.parse().context("parse behind count")?,
    ))
}

/// Parse NUL-separated porcelain v1 output. Paths are verbatim: no quoting,
/// and a rename's source path follows as its own field.
fn parse_status_z(out: &str) -> Result<Vec<StatusEntry>> {
    let mut entries = Vec::new();
    let mut fields = out.split('\0');
    while let Some(field) = fields.next() {
        if field.is_empty() {
            continue;
        }
        let (Some(code), Some(" "), Some(path)) = (field.get(..2), field.get(2..3), field.get(3..))
        else {
            return Err(anyhow!("unexpected porcelain entry: {field:?}"));
        };
        if path.is_empty() {
            return Err(anyhow!("unexpected porcelain entry: {field:?}"));
        }
        if code.contains(['R', 'C']) {
            fields
                .next()
                .filter(|source| !source.is_empty())
                .ok_or_else(|| anyhow!("rename entry without source path: {field:?}"))?;
        }
        entries.push(StatusEntry {
            code: code.to_string(),
            path: path.to_string(),
        });
    }
    Ok(entries)
}
