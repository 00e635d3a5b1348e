//! Interruption, crash recovery, and run-level exclusivity.

use std::collections::BTreeMap;
use std::time::Duration;

use fleet::core::pipeline::PipelineState;
use fleet::core::types::{ExecMode, ReasonCode, RepoOutcome, RepoStatus, TaskKind, WorkItem};
use fleet::exit_codes;
use fleet::io::ledger::{Ledger, LedgerEntry};
use fleet::io::lock::{Lease, LeaseConfig, lease_path};
use fleet::io::run_state::{InFlight, RunLifecycle, RunState, RunStateStore};
use fleet::io::signals::Interrupt;
use fleet::preflight::resolve_target;
use fleet::run::{self, RunOptions, UsageError};
use fleet::test_support::{Script, ScriptedDriver, TestRepo, commit_plan, test_config};

fn committing_driver() -> ScriptedDriver {
    ScriptedDriver::new().with_fallback(Script::plan(&commit_plan("Add notes", &["notes.txt"])))
}

fn repos_with_changes(parent: &std::path::Path, names: &[&str]) -> Vec<TestRepo> {
    names
        .iter()
        .map(|name| {
            let repo = TestRepo::in_dir(parent, name).expect("repo");
            repo.write("notes.txt", "notes\n").expect("write");
            repo
        })
        .collect()
}

#[test]
fn interrupted_run_resumes_where_it_stopped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");
    let repos = repos_with_changes(temp.path(), &["a", "b", "c"]);
    let config = test_config(&state);
    let options = RunOptions {
        repos: repos.iter().map(|r| r.path().to_path_buf()).collect(),
        ..RunOptions::default()
    };

    let interrupt = Interrupt::default();
    let driver = committing_driver().with_script(
        repos[0].path(),
        Script::plan(&commit_plan("Add notes", &["notes.txt"])).interrupting(interrupt.clone()),
    );
    let first = run::execute(&config, &options, &driver, &interrupt).expect("first run");
    assert!(first.interrupted);
    assert_eq!(first.exit_code(), exit_codes::INTERRUPTED);
    assert_eq!(first.remaining, 3);
    assert_eq!(driver.spawn_count(repos[1].path()), 0);
    assert_eq!(repos[0].commit_count().expect("count"), 1);

    let store = RunStateStore::new(&state, config.lock.shared(), Interrupt::default());
    let saved = store.load().expect("load").expect("checkpoint kept");
    assert_eq!(saved.lifecycle, RunLifecycle::Interrupted);
    assert!(saved.in_flight.is_empty());

    let resume = RunOptions {
        resume: true,
        ..RunOptions::default()
    };
    let driver = committing_driver();
    let second =
        run::execute(&config, &resume, &driver, &Interrupt::default()).expect("resumed run");
    assert!(second.resumed);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.exit_code(), exit_codes::OK);
    assert_eq!(second.count(RepoStatus::Completed), 3);
    for repo in &repos {
        assert_eq!(repo.commit_count().expect("count"), 2);
    }
    assert!(store.load().expect("load").is_none());
}

#[test]
fn resume_after_crash_never_reruns_finished_or_executing_items() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");
    let repos = repos_with_changes(temp.path(), &["a", "b", "c", "d"]);
    let config = test_config(&state);

    let items: Vec<WorkItem> = repos
        .iter()
        .map(|r| WorkItem {
            target: resolve_target(r.path(), &config),
            task: TaskKind::Commit,
            mode: ExecMode::Full,
        })
        .collect();
    let ids: Vec<String> = items.iter().map(|i| i.target.id.clone()).collect();
    let mut checkpoint = RunState::new("crashed-run".into(), TaskKind::Commit, ExecMode::Full, items);
    checkpoint.lifecycle = RunLifecycle::Executing;
    checkpoint.mark_completed(&ids[0]);
    checkpoint.in_flight.insert(
        0,
        InFlight {
            phase: PipelineState::Executing,
            ..InFlight::new(ids[2].clone())
        },
    );
    let store = RunStateStore::new(&state, config.lock.shared(), Interrupt::default());
    store.save(&checkpoint).expect("save");

    // `b` finished and hit the ledger, but the process died before the
    // checkpoint save.
    let ledger = Ledger::new(&state);
    for repo in [&ids[0], &ids[1]] {
        let outcome = RepoOutcome::completed(repo, Some("commit abc".into()), Duration::ZERO);
        ledger
            .append(&LedgerEntry::from_outcome("crashed-run", TaskKind::Commit, &outcome))
            .expect("append");
    }

    let driver = committing_driver();
    let options = RunOptions {
        resume: true,
        ..RunOptions::default()
    };
    let summary = run::execute(&config, &options, &driver, &Interrupt::default()).expect("run");

    assert_eq!(driver.spawn_count(repos[0].path()), 0);
    assert_eq!(driver.spawn_count(repos[1].path()), 0);
    assert_eq!(driver.spawn_count(repos[2].path()), 0);
    assert_eq!(driver.spawn_count(repos[3].path()), 1);
    assert_eq!(summary.exit_code(), exit_codes::PARTIAL_FAILURE);

    let by_repo: BTreeMap<String, LedgerEntry> = ledger
        .entries_for_run("crashed-run")
        .expect("ledger")
        .into_iter()
        .map(|e| (e.repo.clone(), e))
        .collect();
    assert_eq!(by_repo.len(), 4);
    assert_eq!(
        by_repo[&ids[2]].reason,
        Some(ReasonCode::InterruptedDuringExecute)
    );
    assert_eq!(by_repo[&ids[3]].status, RepoStatus::Completed);
    assert!(store.load().expect("load").is_none());
}

#[test]
fn failed_record_after_commit_is_not_committed_again() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");
    let repos = repos_with_changes(temp.path(), &["a"]);
    let config = test_config(&state);
    // A directory where the ledger file belongs makes every append fail.
    let ledger_path = state.join("ledger.jsonl");
    std::fs::create_dir_all(&ledger_path).expect("mkdir");

    let options = RunOptions {
        repos: vec![repos[0].path().to_path_buf()],
        ..RunOptions::default()
    };
    let driver = committing_driver();
    let err = run::execute(&config, &options, &driver, &Interrupt::default()).unwrap_err();
    assert!(format!("{err:#}").contains("append ledger"), "{err:#}");
    assert_eq!(repos[0].commit_count().expect("count"), 2);

    let store = RunStateStore::new(&state, config.lock.shared(), Interrupt::default());
    let saved = store.load().expect("load").expect("checkpoint kept");
    assert_eq!(saved.lifecycle, RunLifecycle::Failed);
    let held = saved.in_flight.values().next().expect("in-flight item kept");
    assert!(held.may_have_mutated());

    std::fs::remove_dir(&ledger_path).expect("rmdir");
    let resume = RunOptions {
        resume: true,
        ..RunOptions::default()
    };
    let driver = committing_driver();
    let summary = run::execute(&config, &resume, &driver, &Interrupt::default()).expect("resume");
    assert_eq!(driver.total_spawns(), 0);
    assert_eq!(repos[0].commit_count().expect("count"), 2);
    assert_eq!(summary.exit_code(), exit_codes::PARTIAL_FAILURE);
    assert_eq!(
        summary.outcomes[0].reason,
        Some(ReasonCode::InterruptedDuringExecute)
    );
}

#[test]
fn failure_before_interruption_still_fails_the_resumed_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");
    let repos = repos_with_changes(temp.path(), &["a", "b", "c"]);
    repos[0].write(".env", "DEBUG=1\n").expect("write");
    let config = test_config(&state);
    let options = RunOptions {
        repos: repos.iter().map(|r| r.path().to_path_buf()).collect(),
        ..RunOptions::default()
    };

    let interrupt = Interrupt::default();
    let driver = committing_driver()
        .with_script(
            repos[0].path(),
            Script::plan(&commit_plan("Add env", &[".env"])),
        )
        .with_script(
            repos[1].path(),
            Script::plan(&commit_plan("Add notes", &["notes.txt"])).interrupting(interrupt.clone()),
        );
    let first = run::execute(&config, &options, &driver, &interrupt).expect("first run");
    assert_eq!(first.exit_code(), exit_codes::INTERRUPTED);
    assert_eq!(first.count(RepoStatus::Failed), 1);

    let resume = RunOptions {
        resume: true,
        ..RunOptions::default()
    };
    let second = run::execute(&config, &resume, &committing_driver(), &Interrupt::default())
        .expect("resumed run");
    assert_eq!(second.count(RepoStatus::Completed), 2);
    assert_eq!(second.count(RepoStatus::Failed), 0);
    assert_eq!(second.earlier.len(), 1);
    assert_eq!(second.earlier[0].reason, Some(ReasonCode::Denylist));
    assert_eq!(second.exit_code(), exit_codes::PARTIAL_FAILURE);
}

#[test]
fn unfinished_run_requires_resume_or_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");
    let repos = repos_with_changes(temp.path(), &["a"]);
    let config = test_config(&state);
    let store = RunStateStore::new(&state, config.lock.shared(), Interrupt::default());
    let items = vec![WorkItem {
        target: resolve_target(repos[0].path(), &config),
        task: TaskKind::Commit,
        mode: ExecMode::Full,
    }];
    store
        .save(&RunState::new("old".into(), TaskKind::Commit, ExecMode::Full, items))
        .expect("save");

    let fresh = RunOptions {
        repos: vec![repos[0].path().to_path_buf()],
        ..RunOptions::default()
    };
    let driver = committing_driver();
    let err = run::execute(&config, &fresh, &driver, &Interrupt::default()).unwrap_err();
    assert!(err.downcast_ref::<UsageError>().is_some(), "{err:#}");

    let restart = RunOptions {
        restart: true,
        ..fresh
    };
    let summary = run::execute(&config, &restart, &driver, &Interrupt::default()).expect("run");
    assert_ne!(summary.run_id, "old");
    assert_eq!(summary.exit_code(), exit_codes::OK);
}

#[test]
fn second_run_on_same_state_dir_is_refused() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("state");
    std::fs::create_dir_all(&state).expect("mkdir");
    let repos = repos_with_changes(temp.path(), &["a"]);
    let _active = Lease::acquire(
        &lease_path(&state, "run"),
        &LeaseConfig::fail_fast(),
        &Interrupt::default(),
    )
    .expect("lease");

    let options = RunOptions {
        repos: vec![repos[0].path().to_path_buf()],
        ..RunOptions::default()
    };
    let driver = committing_driver();
    let err = run::execute(&test_config(&state), &options, &driver, &Interrupt::default())
        .unwrap_err();
    assert!(format!("{err:#}").contains("another run is active"));
    assert_eq!(driver.total_spawns(), 0);
}

#[test]
fn resume_without_checkpoint_is_a_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let options = RunOptions {
        resume: true,
        ..RunOptions::default()
    };
    let err = run::execute(
        &test_config(temp.path()),
        &options,
        &ScriptedDriver::new(),
        &Interrupt::default(),
    )
    .unwrap_err();
    assert!(err.downcast_ref::<UsageError>().is_some());
}
