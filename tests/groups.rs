//! Task groups and application barriers

mod common;

use std::thread;
use std::time::Duration;

use common::*;
use pretty_assertions::assert_eq;
use taskweave::{OnFailure, RuntimeError, TaskSpec, TaskStatus};

fn close_with_concurrent_completion(reverse: bool) {
    let h = harness();
    h.runtime.open_task_group(APP, "g1", true).unwrap();
    let a = h.runtime.submit_task(TaskSpec::new(APP, "work")).unwrap();
    let b = h.runtime.submit_task(TaskSpec::new(APP, "work")).unwrap();
    assert_eq!(h.executor.submitted_ids(), vec![a, b]);

    let executor = h.executor.clone();
    let completer = thread::spawn(move || {
        let order = if reverse { [b, a] } else { [a, b] };
        for id in order {
            thread::sleep(Duration::from_millis(30));
            executor.succeed(id).unwrap();
        }
    });

    let report = h.runtime.close_task_group(APP, "g1").unwrap().unwrap();
    assert_eq!(h.runtime.status(a).unwrap(), TaskStatus::Finished);
    assert_eq!(h.runtime.status(b).unwrap(), TaskStatus::Finished);
    assert_eq!(report.waited, 2);
    assert!(report.is_success());
    completer.join().unwrap();
}

#[test]
fn test_implicit_barrier_close_waits_for_members() {
    close_with_concurrent_completion(false);
}

#[test]
fn test_implicit_barrier_close_any_completion_order() {
    close_with_concurrent_completion(true);
}

#[test]
fn test_close_without_implicit_barrier_returns_at_once() {
    let h = harness();
    h.runtime.open_task_group(APP, "g", false).unwrap();
    let a = h.runtime.submit_task(TaskSpec::new(APP, "work")).unwrap();

    assert_eq!(h.runtime.close_task_group(APP, "g").unwrap(), None);
    assert_eq!(h.runtime.status(a).unwrap(), TaskStatus::Running);

    // Tasks submitted after closing are not members
    let later = h.runtime.submit_task(TaskSpec::new(APP, "work")).unwrap();
    assert_eq!(h.runtime.task(a).unwrap().groups, vec!["g".to_string()]);
    assert!(h.runtime.task(later).unwrap().groups.is_empty());
}

#[test]
fn test_duplicate_and_unknown_groups() {
    let h = harness();
    h.runtime.open_task_group(APP, "g", false).unwrap();
    let err = h.runtime.open_task_group(APP, "g", false).unwrap_err();
    assert!(matches!(err, RuntimeError::DuplicateGroup { .. }));

    // Same name under another application is independent
    h.runtime.open_task_group(2, "g", false).unwrap();

    h.runtime.close_task_group(APP, "g").unwrap();
    h.runtime.open_task_group(APP, "g", false).unwrap();

    let err = h.runtime.barrier_group(APP, "missing").unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownGroup { .. }));
}

#[test]
fn test_barrier_group_aggregates_failures() {
    let h = harness();
    h.runtime.open_task_group(APP, "g", false).unwrap();
    let ok = h.runtime.submit_task(TaskSpec::new(APP, "work")).unwrap();
    let bad = h
        .runtime
        .submit_task(TaskSpec::new(APP, "work").with_on_failure(OnFailure::Fail))
        .unwrap();

    let executor = h.executor.clone();
    let completer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        executor.fail(bad, "disk full").unwrap();
        executor.succeed(ok).unwrap();
    });

    let report = h.runtime.barrier_group(APP, "g").unwrap();
    completer.join().unwrap();

    assert_eq!(report.group.as_deref(), Some("g"));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].task_id, bad);
    let message = report.exception_message().unwrap();
    assert!(message.contains("disk full"), "{}", message);
    assert!(message.contains("'g'"), "{}", message);
}

#[test]
fn test_group_barrier_follows_retries() {
    let h = harness();
    h.runtime.open_task_group(APP, "g", true).unwrap();
    let a = h.runtime.submit_task(TaskSpec::new(APP, "work")).unwrap();

    let executor = h.executor.clone();
    let runtime = h.runtime.clone();
    let completer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        executor.fail(a, "flaky").unwrap();
        let retry = runtime.latest_attempt(a);
        thread::sleep(Duration::from_millis(20));
        executor.succeed(retry).unwrap();
        retry
    });

    let report = h.runtime.close_task_group(APP, "g").unwrap().unwrap();
    let retry = completer.join().unwrap();
    assert!(report.is_success());
    assert_eq!(h.runtime.status(retry).unwrap(), TaskStatus::Finished);
}

#[test]
fn test_application_barrier_snapshots_and_drains() {
    let h = harness();
    let a = h
        .runtime
        .submit_task(TaskSpec::new(APP, "work").with_on_failure(OnFailure::Fail))
        .unwrap();
    let other_app = h.runtime.submit_task(TaskSpec::new(2, "work")).unwrap();

    let executor = h.executor.clone();
    let completer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        executor.fail(a, "boom").unwrap();
    });

    // Tasks of other applications are not awaited
    let report = h.runtime.barrier(APP);
    completer.join().unwrap();
    assert_eq!(report.waited, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(h.runtime.status(other_app).unwrap(), TaskStatus::Running);

    // Failures are reported once
    let again = h.runtime.barrier(APP);
    assert!(again.is_success());
}
