//! Concurrent consumers of one on-disk queue each get distinct items.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use fleet::core::types::{ExecMode, RepoOverrides, RepoTarget, TaskKind, WorkItem};
use fleet::io::lock::LeaseConfig;
use fleet::io::queue::WorkQueue;
use fleet::io::signals::Interrupt;

fn item(i: usize) -> WorkItem {
    let path = PathBuf::from(format!("/fleet/repo-{i:02}"));
    WorkItem {
        target: RepoTarget {
            id: path.display().to_string(),
            path,
            branch: None,
            upstream: None,
            overrides: RepoOverrides::default(),
        },
        task: TaskKind::Commit,
        mode: ExecMode::Full,
    }
}

#[test]
fn every_item_is_dequeued_exactly_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let lease = LeaseConfig {
        timeout: Duration::from_secs(20),
        stale_after: Some(Duration::from_secs(60)),
        poll: Duration::from_millis(1),
    };
    let total = 16;
    WorkQueue::new(temp.path(), lease, Interrupt::default())
        .enqueue_all((0..total).map(item).collect())
        .expect("enqueue");

    let taken: Vec<String> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dir = temp.path();
                scope.spawn(move || {
                    // Separate handles, as separate processes would have.
                    let queue = WorkQueue::new(dir, lease, Interrupt::default())
                        .with_dequeue_delay(Duration::from_millis(5));
                    let mut mine = Vec::new();
                    while let Some(item) = queue.dequeue().expect("dequeue") {
                        mine.push(item.target.id);
                    }
                    mine
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().expect("join"))
            .collect()
    });

    let distinct: BTreeSet<&String> = taken.iter().collect();
    assert_eq!(taken.len(), total);
    assert_eq!(distinct.len(), total);
    assert!(
        WorkQueue::new(temp.path(), lease, Interrupt::default())
            .pending()
            .expect("pending")
            .is_empty()
    );
}
