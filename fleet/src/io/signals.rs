//! Process-level interrupt flag wired to SIGINT/SIGTERM.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::warn;

/// Longest uninterrupted sleep slice while waiting on a timer.
const SLICE: Duration = Duration::from_millis(100);

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Sleep for `duration` in short slices. Returns `false` if interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_set() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLICE.min(deadline - now));
        }
    }
}

/// Route SIGINT/SIGTERM (Ctrl-C on Windows) to `interrupt`.
///
/// The first signal requests a graceful stop; a second one exits immediately.
pub fn install(interrupt: &Interrupt) -> Result<()> {
    let flag = interrupt.clone();
    ctrlc::set_handler(move || {
        if flag.is_set() {
            std::process::exit(crate::exit_codes::INTERRUPTED);
        }
        warn!("interrupt received; finishing in-flight work and saving state");
        flag.trigger();
    })
    .context("install signal handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_returns_early_when_triggered() {
        let interrupt = Interrupt::default();
        let remote = interrupt.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.trigger();
        });
        let start = Instant::now();
        assert!(!interrupt.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().expect("join");
    }

    #[test]
    fn sleep_completes_without_signal() {
        assert!(Interrupt::default().sleep(Duration::from_millis(10)));
    }
}
