//! Persisted FIFO of work items (`queue.json`).
//!
//! Every dequeue is "load, pop front, persist remainder" under the queue
//! lease, so two workers never receive the same item, whether they are
//! threads of one process or separate processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::WorkItem;
use crate::io::atomic::{read_json, remove_if_exists, write_json};
use crate::io::lock::{Lease, LeaseConfig, lease_path};
use crate::io::signals::Interrupt;

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    items: Vec<WorkItem>,
}

#[derive(Debug, Clone)]
pub struct WorkQueue {
    path: PathBuf,
    lease: PathBuf,
    lease_config: LeaseConfig,
    interrupt: Interrupt,
    dequeue_delay: Duration,
}

impl WorkQueue {
    pub fn new(state_dir: &Path, lease_config: LeaseConfig, interrupt: Interrupt) -> Self {
        Self {
            path: state_dir.join("queue.json"),
            lease: lease_path(state_dir, "queue"),
            lease_config,
            interrupt,
            dequeue_delay: Duration::ZERO,
        }
    }

    /// Hold the lease this long during every dequeue, widening the race window.
    #[cfg(any(test, feature = "test-support"))]
    pub fn with_dequeue_delay(mut self, delay: Duration) -> Self {
        self.dequeue_delay = delay;
        self
    }

    fn lock(&self) -> Result<Lease> {
        Lease::acquire(&self.lease, &self.lease_config, &self.interrupt)
    }

    /// Replace the queue contents with `items`, sorted by repository id.
    #[instrument(skip_all, fields(count = items.len()))]
    pub fn enqueue_all(&self, mut items: Vec<WorkItem>) -> Result<()> {
        items.sort_by(|a, b| a.target.id.cmp(&b.target.id));
        items.dedup_by(|a, b| a.target.id == b.target.id);
        let _lease = self.lock()?;
        write_json(&self.path, &QueueFile { items })
    }

    /// Pop the front item, or `None` when the queue is drained.
    pub fn dequeue(&self) -> Result<Option<WorkItem>> {
        let _lease = self.lock()?;
        let mut file: QueueFile = read_json(&self.path)?.unwrap_or_default();
        if file.items.is_empty() {
            return Ok(None);
        }
        let item = file.items.remove(0);
        if !self.dequeue_delay.is_zero() {
            std::thread::sleep(self.dequeue_delay);
        }
        write_json(&self.path, &file)?;
        debug!(repo = %item.target.id, remaining = file.items.len(), "dequeued");
        Ok(Some(item))
    }

    /// Items not yet handed to a worker.
    pub fn pending(&self) -> Result<Vec<WorkItem>> {
        let file: Option<QueueFile> = read_json(&self.path)?;
        Ok(file.map(|f| f.items).unwrap_or_default())
    }

    pub fn clear(&self) -> Result<()> {
        let _lease = self.lock()?;
        remove_if_exists(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExecMode, RepoOverrides, RepoTarget, TaskKind};

    fn item(id: &str) -> WorkItem {
        WorkItem {
            target: RepoTarget {
                id: id.to_string(),
                path: PathBuf::from(id),
                branch: Some("main".into()),
                upstream: None,
                overrides: RepoOverrides::default(),
            },
            task: TaskKind::Commit,
            mode: ExecMode::Full,
        }
    }

    fn queue(dir: &Path) -> WorkQueue {
        let lease = LeaseConfig {
            timeout: Duration::from_secs(10),
            stale_after: Some(Duration::from_secs(60)),
            poll: Duration::from_millis(2),
        };
        WorkQueue::new(dir, lease, Interrupt::default())
    }

    #[test]
    fn dequeues_in_sorted_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let q = queue(temp.path());
        q.enqueue_all(vec![item("/c"), item("/a"), item("/b"), item("/a")])
            .expect("enqueue");
        let order: Vec<String> = std::iter::from_fn(|| q.dequeue().expect("dequeue"))
            .map(|i| i.target.id)
            .collect();
        assert_eq!(order, vec!["/a", "/b", "/c"]);
        assert!(q.pending().expect("pending").is_empty());
    }

    #[test]
    fn empty_or_missing_queue_yields_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let q = queue(temp.path());
        assert!(q.dequeue().expect("dequeue").is_none());
    }

    #[test]
    fn clear_removes_queue_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let q = queue(temp.path());
        q.enqueue_all(vec![item("/a")]).expect("enqueue");
        q.clear().expect("clear");
        assert!(q.pending().expect("pending").is_empty());
    }
}
