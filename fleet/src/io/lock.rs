//! Portable cross-process mutex built on atomic directory creation.
//!
//! A lease is the directory `<name>.lock/` holding `owner.json`. Creating the
//! directory is the atomic step; the owner record lets other processes probe
//! liveness and reclaim leases left behind by dead owners.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::FleetError;
use crate::io::signals::Interrupt;

const OWNER_FILE: &str = "owner.json";

/// Owner record stored inside a lease directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseOwner {
    pub pid: u32,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Give up after this long. Zero means a single attempt.
    pub timeout: Duration,
    /// Leases older than this are reclaimed even if the owner looks alive.
    /// `None` relies on the liveness probe alone (long-held leases).
    pub stale_after: Option<Duration>,
    pub poll: Duration,
}

impl LeaseConfig {
    /// Single attempt, no waiting.
    pub fn fail_fast() -> Self {
        Self {
            timeout: Duration::ZERO,
            stale_after: None,
            poll: Duration::from_millis(10),
        }
    }
}

/// Path of the lease directory for `name` under `dir`.
pub fn lease_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.lock"))
}

/// A held lease. Released on drop if not released explicitly.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    token: String,
    released: bool,
}

impl Lease {
    /// Acquire the lease at `path`, waiting up to `config.timeout`.
    ///
    /// Fails with [`FleetError::LockTimeout`] when the lease stays held, or
    /// [`FleetError::Interrupted`] when `interrupt` fires while waiting.
    #[instrument(skip_all, fields(lease = %path.display()))]
    pub fn acquire(path: &Path, config: &LeaseConfig, interrupt: &Interrupt) -> Result<Lease> {
        let start = Instant::now();
        loop {
            match fs::create_dir(path) {
                Ok(()) => return Lease::claim(path),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    let parent = path
                        .parent()
                        .with_context(|| format!("lease path missing parent {}", path.display()))?;
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create lease parent {}", parent.display()))?;
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lease {}", path.display()));
                }
            }

            let owner = read_owner(path);
            if let Some(why) = staleness(path, owner.as_ref(), config.stale_after) {
                warn!(
                    lease = %path.display(),
                    owner_pid = ?owner.as_ref().map(|o| o.pid),
                    why,
                    "reclaiming stale lease"
                );
                reclaim(path, owner.as_ref(), config.stale_after)?;
                continue;
            }

            let elapsed = start.elapsed();
            if elapsed >= config.timeout {
                return Err(FleetError::LockTimeout {
                    name: lease_name(path),
                    owner_pid: owner.map(|o| o.pid),
                }
                .into());
            }
            if interrupt.is_set() {
                return Err(FleetError::Interrupted.into());
            }
            thread::sleep(config.poll.min(config.timeout - elapsed));
        }
    }

    fn claim(path: &Path) -> Result<Lease> {
        let owner = LeaseOwner {
            pid: std::process::id(),
            token: format!("{:016x}", rand::random::<u64>()),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_string(&owner).context("serialize lease owner")?;
        if let Err(err) = fs::write(path.join(OWNER_FILE), body) {
            let _ = fs::remove_dir_all(path);
            return Err(err).with_context(|| format!("write lease owner {}", path.display()));
        }
        debug!(lease = %path.display(), "lease acquired");
        Ok(Lease {
            path: path.to_path_buf(),
            token: owner.token,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lease. Idempotent; a lease that now belongs to someone
    /// else (ours was reclaimed) is left alone.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match read_owner(&self.path) {
            Some(owner) if owner.token == self.token => {}
            Some(owner) => {
                warn!(
                    lease = %self.path.display(),
                    owner_pid = owner.pid,
                    "lease was reclaimed by another owner; not releasing"
                );
                return Ok(());
            }
            // Already gone, or a new owner is mid-claim.
            None => return Ok(()),
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                debug!(lease = %self.path.display(), "lease released");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove lease {}", self.path.display())),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(err = %err, lease = %self.path.display(), "failed to release lease");
        }
    }
}

/// Read the owner record of a lease, if present and parseable.
pub fn read_owner(path: &Path) -> Option<LeaseOwner> {
    let contents = fs::read_to_string(path.join(OWNER_FILE)).ok()?;
    serde_json::from_str(&contents).ok()
}

fn lease_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().trim_end_matches(".lock").to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn staleness(
    path: &Path,
    owner: Option<&LeaseOwner>,
    stale_after: Option<Duration>,
) -> Option<&'static str> {
    if let Some(owner) = owner
        && !pid_alive(owner.pid)
    {
        return Some("owner process is gone");
    }
    let limit = stale_after?;
    let age = match owner {
        Some(owner) => (Utc::now() - owner.acquired_at).to_std().unwrap_or_default(),
        None => unowned_age(path),
    };
    (age > limit).then_some("lease exceeded staleness threshold")
}

/// Age of a lease without a readable owner: the owner file's age if one is
/// being written, else the directory's.
fn unowned_age(path: &Path) -> Duration {
    let owner_file = path.join(OWNER_FILE);
    let probe = if owner_file.exists() { owner_file } else { path.to_path_buf() };
    fs::metadata(probe)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

/// Move the stale lease aside, confirm it is the one judged stale, delete it.
///
/// A lease that turns out to be live is put back; if that fails the error is
/// returned and the moved lease is left in place, never deleted.
fn reclaim(path: &Path, judged: Option<&LeaseOwner>, stale_after: Option<Duration>) -> Result<()> {
    let aside = path.with_extension(format!("stale.{:08x}", rand::random::<u32>()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        // Someone else reclaimed or released it first.
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reclaim lease {}", path.display())),
    }
    let same = match (judged, read_owner(&aside)) {
        (Some(a), Some(b)) => a.token == b.token,
        // Still ownerless after the move, and old enough to be abandoned.
        (None, None) => stale_after.is_some_and(|limit| unowned_age(&aside) > limit),
        _ => false,
    };
    settle(path, &aside, same)
}

/// Delete the moved-aside lease when it is the stale one, else put it back.
fn settle(path: &Path, aside: &Path, stale: bool) -> Result<()> {
    if stale {
        return fs::remove_dir_all(aside)
            .with_context(|| format!("remove stale lease {}", aside.display()));
    }
    // A fresh lease replaced the stale one between the check and the rename.
    fs::rename(aside, path).with_context(|| {
        format!(
            "restore live lease {} from {}; remove it by hand once its owner is gone",
            path.display(),
            aside.display()
        )
    })
}

/// Whether a process with `pid` is still running.
#[cfg(target_os = "linux")]
pub fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(true)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(timeout_ms: u64) -> LeaseConfig {
        LeaseConfig {
            timeout: Duration::from_millis(timeout_ms),
            stale_after: Some(Duration::from_secs(60)),
            poll: Duration::from_millis(5),
        }
    }

    #[test]
    fn second_acquire_times_out_with_owner_pid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lease_path(temp.path(), "queue");
        let interrupt = Interrupt::default();
        let held = Lease::acquire(&path, &quick(0), &interrupt).expect("first");

        let err = Lease::acquire(&path, &quick(30), &interrupt).unwrap_err();
        match FleetError::find(&err) {
            Some(FleetError::LockTimeout { name, owner_pid }) => {
                assert_eq!(name, "queue");
                assert_eq!(*owner_pid, Some(std::process::id()));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        held.release().expect("release");
        Lease::acquire(&path, &quick(0), &interrupt).expect("after release");
    }

    #[test]
    fn release_is_idempotent_and_drop_releases() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lease_path(temp.path(), "state");
        let interrupt = Interrupt::default();
        {
            let _lease = Lease::acquire(&path, &quick(0), &interrupt).expect("acquire");
            assert!(path.join(OWNER_FILE).exists());
        }
        assert!(!path.exists());

        let lease = Lease::acquire(&path, &quick(0), &interrupt).expect("acquire");
        fs::remove_dir_all(&path).expect("simulate external cleanup");
        lease.release().expect("release of vanished lease");
    }

    #[test]
    fn dead_owner_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lease_path(temp.path(), "backoff");
        fs::create_dir_all(&path).expect("mkdir");
        let dead = LeaseOwner {
            pid: u32::MAX - 1,
            token: "dead".into(),
            acquired_at: Utc::now(),
        };
        fs::write(
            path.join(OWNER_FILE),
            serde_json::to_string(&dead).expect("json"),
        )
        .expect("write owner");

        let lease = Lease::acquire(&path, &quick(0), &Interrupt::default()).expect("reclaim");
        let owner = read_owner(lease.path()).expect("owner");
        assert_eq!(owner.pid, std::process::id());
    }

    #[test]
    fn aged_lease_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lease_path(temp.path(), "old");
        fs::create_dir_all(&path).expect("mkdir");
        let old = LeaseOwner {
            pid: std::process::id(),
            token: "old".into(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        fs::write(
            path.join(OWNER_FILE),
            serde_json::to_string(&old).expect("json"),
        )
        .expect("write owner");

        Lease::acquire(&path, &quick(0), &Interrupt::default()).expect("reclaim aged");
    }

    #[test]
    fn reclaim_puts_back_a_lease_that_is_not_the_stale_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lease_path(temp.path(), "raced");
        let interrupt = Interrupt::default();
        let live = Lease::acquire(&path, &quick(0), &interrupt).expect("acquire");
        let token = read_owner(&path).expect("owner").token;

        // Judged ownerless, but a fresh owner is present by the time of the move.
        reclaim(&path, None, Some(Duration::from_secs(60))).expect("reclaim");
        assert_eq!(read_owner(&path).expect("owner").token, token);

        let stale = LeaseOwner {
            pid: u32::MAX - 1,
            token: "stale".into(),
            acquired_at: Utc::now(),
        };
        reclaim(&path, Some(&stale), None).expect("reclaim");
        assert_eq!(read_owner(&path).expect("owner").token, token);

        live.release().expect("release");
        assert!(!path.exists());
    }

    #[test]
    fn young_ownerless_lease_is_kept() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lease_path(temp.path(), "claiming");
        fs::create_dir_all(&path).expect("mkdir");

        reclaim(&path, None, Some(Duration::from_secs(60))).expect("reclaim");
        assert!(path.exists());
        let err = Lease::acquire(&path, &quick(0), &Interrupt::default()).unwrap_err();
        assert!(matches!(
            FleetError::find(&err),
            Some(FleetError::LockTimeout { owner_pid: None, .. })
        ));
    }

    #[test]
    fn failed_restore_keeps_the_moved_lease() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lease_path(temp.path(), "contended");
        let aside = path.with_extension("stale.0000beef");
        fs::create_dir_all(&aside).expect("mkdir");
        fs::write(aside.join(OWNER_FILE), "{}").expect("write owner");
        // Someone claimed the name again before the live lease could go back.
        fs::create_dir_all(path.join("other")).expect("mkdir");

        let err = settle(&path, &aside, false).unwrap_err();
        assert!(format!("{err:#}").contains("restore live lease"));
        assert!(aside.join(OWNER_FILE).exists());
        assert!(path.join("other").exists());
    }

    #[test]
    fn interrupt_stops_waiting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lease_path(temp.path(), "run");
        let interrupt = Interrupt::default();
        let _held = Lease::acquire(&path, &quick(0), &interrupt).expect("first");
        interrupt.trigger();
        let err = Lease::acquire(&path, &quick(5_000), &interrupt).unwrap_err();
        assert!(matches!(
            FleetError::find(&err),
            Some(FleetError::Interrupted)
        ));
    }

    #[test]
    fn threads_never_hold_the_lease_together() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lease_path(temp.path(), "shared");
        let inside = Arc::new(AtomicUsize::new(0));
        let interrupt = Interrupt::default();

        thread::scope(|scope| {
            for _ in 0..4 {
                let inside = Arc::clone(&inside);
                let path = path.clone();
                let interrupt = interrupt.clone();
                scope.spawn(move || {
                    for _ in 0..10 {
                        let lease =
                            Lease::acquire(&path, &quick(10_000), &interrupt).expect("acquire");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lease.release().expect("release");
                    }
                });
            }
        });
    }
}
