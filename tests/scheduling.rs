//! Dependency detection, dispatch order and failure policies

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use common::*;
use pretty_assertions::assert_eq;
use taskweave::{
    DataId, Direction, OnFailure, Parameter, Producer, RuntimeError, RuntimeEvent, TaskOutcome,
    TaskSpec, TaskStatus, VersionState,
};

#[test]
fn test_reader_waits_for_producer() {
    let h = harness();
    let a = h.runtime.submit_task(writer("x")).unwrap();
    let b = h.runtime.submit_task(reader("x")).unwrap();

    assert_eq!(h.runtime.task(b).unwrap().predecessors, vec![a]);
    assert_eq!(h.executor.submitted_ids(), vec![a]);
    assert_eq!(h.runtime.status(b).unwrap(), TaskStatus::Pending);

    h.executor.succeed(a).unwrap();
    assert_eq!(h.runtime.status(a).unwrap(), TaskStatus::Finished);
    assert_eq!(h.executor.submitted_ids(), vec![b]);

    let dispatched = h.executor.submitted().remove(0);
    let read = dispatched.parameters[0].read.clone().unwrap();
    assert_eq!(read.number, 0);
    assert_eq!(read.location.path().unwrap(), &h.dir.path().join("d1v0"));
}

#[test]
fn test_external_input_is_ready_at_once() {
    let h = harness();
    let a = h.runtime.submit_task(reader("input.txt")).unwrap();

    assert!(h.runtime.task(a).unwrap().predecessors.is_empty());
    assert_eq!(h.executor.submitted_ids(), vec![a]);
    let versions = h.runtime.versions(&DataId::file("input.txt"));
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].state, VersionState::Written);
}

#[test]
fn test_writer_waits_for_readers_of_superseded_version() {
    let h = harness();
    let r1 = h.runtime.submit_task(reader("x")).unwrap();
    let r2 = h.runtime.submit_task(reader("x")).unwrap();
    let w = h.runtime.submit_task(writer("x")).unwrap();

    assert_eq!(h.runtime.task(w).unwrap().predecessors, vec![r1, r2]);
    assert_eq!(h.executor.submitted_ids(), vec![r1, r2]);

    h.executor.succeed(r2).unwrap();
    assert_eq!(h.runtime.status(w).unwrap(), TaskStatus::Pending);
    h.executor.succeed(r1).unwrap();
    assert_eq!(h.executor.submitted_ids(), vec![w]);
}

#[test]
fn test_consecutive_writers_are_ordered() {
    let h = harness();
    let a = h.runtime.submit_task(writer("x")).unwrap();
    let b = h.runtime.submit_task(writer("x")).unwrap();

    assert_eq!(h.runtime.task(b).unwrap().predecessors, vec![a]);
    assert_eq!(h.executor.submitted_ids(), vec![a]);

    h.executor.succeed(a).unwrap();
    h.executor.succeed(b).unwrap();
    let states: Vec<_> = h
        .runtime
        .versions(&DataId::file("x"))
        .iter()
        .map(|version| (version.number, version.state))
        .collect();
    assert_eq!(
        states,
        vec![(0, VersionState::Written), (1, VersionState::Written)]
    );
}

#[test]
fn test_inout_chain_runs_in_declaration_order() {
    let h = harness();
    let ids: Vec<_> = (0..3)
        .map(|_| h.runtime.submit_task(updater("acc")).unwrap())
        .collect();

    for (i, id) in ids.iter().enumerate() {
        assert_eq!(h.executor.submitted_ids(), vec![*id]);
        let dispatched = h.executor.submitted().remove(0);
        let parameter = &dispatched.parameters[0];
        assert_eq!(parameter.read.as_ref().unwrap().number, i as u64);
        assert_eq!(parameter.write.as_ref().unwrap().number, i as u64 + 1);
        h.executor.succeed(*id).unwrap();
    }
    assert!(h.executor.submitted_ids().is_empty());
}

#[test]
fn test_ready_tasks_dispatch_by_priority_then_submission() {
    let h = harness();
    let a = h.runtime.submit_task(writer("x")).unwrap();
    let low = h.runtime.submit_task(reader("x")).unwrap();
    let high = h.runtime.submit_task(reader("x").with_priority(5)).unwrap();
    let low_later = h.runtime.submit_task(reader("x")).unwrap();

    h.executor.succeed(a).unwrap();
    assert_eq!(h.executor.submitted_ids(), vec![high, low, low_later]);
}

#[test]
fn test_cancel_successor_cancels_dependents_without_dispatch() {
    let h = harness();
    let a = h
        .runtime
        .submit_task(failing_writer("x", OnFailure::CancelSuccessor))
        .unwrap();
    let b = h
        .runtime
        .submit_task(
            reader("x").with_parameter(Parameter::file(Direction::Out, "y")),
        )
        .unwrap();
    let c = h.runtime.submit_task(reader("y")).unwrap();

    h.executor.fail(a, "failed").unwrap();

    assert_eq!(h.runtime.status(a).unwrap(), TaskStatus::Failed);
    assert_eq!(h.runtime.status(b).unwrap(), TaskStatus::Cancelled);
    assert_eq!(h.runtime.status(c).unwrap(), TaskStatus::Cancelled);
    assert!(h.executor.submitted_ids().is_empty());

    let running: Vec<_> = h
        .runtime
        .events()
        .into_iter()
        .filter(|event| matches!(event.event, RuntimeEvent::TaskRunning { .. }))
        .filter_map(|event| event.event.task_id())
        .collect();
    assert_eq!(running, vec![a]);

    // Neither the failed producer's version nor the cancelled ones are current
    let x = h.runtime.versions(&DataId::file("x"));
    assert_eq!(x[0].state, VersionState::Cancelled);
    let y = h.runtime.versions(&DataId::file("y"));
    assert_eq!(y[0].state, VersionState::Cancelled);
}

#[test]
fn test_cancelled_version_rolls_back_for_new_readers() {
    let h = harness();
    let a = h
        .runtime
        .submit_task(failing_writer("x", OnFailure::CancelSuccessor))
        .unwrap();
    h.executor.fail(a, "failed").unwrap();

    let b = h.runtime.submit_task(reader("x")).unwrap();
    assert_eq!(h.executor.submitted_ids(), vec![b]);
    let dispatched = h.executor.submitted().remove(0);
    // Version numbers are never reused, the rollback binds a fresh one
    assert_eq!(dispatched.parameters[0].read.as_ref().unwrap().number, 1);
}

#[test]
fn test_fail_policy_fails_dependents_fast() {
    let h = harness();
    let a = h.runtime.submit_task(failing_writer("x", OnFailure::Fail)).unwrap();
    let b = h
        .runtime
        .submit_task(reader("x").with_on_failure(OnFailure::Fail))
        .unwrap();

    h.executor.fail(a, "failed").unwrap();

    assert_eq!(h.runtime.status(b).unwrap(), TaskStatus::Failed);
    assert!(h.executor.submitted_ids().is_empty());
    let error = h.runtime.task(b).unwrap().error.unwrap();
    assert!(error.contains(&format!("producer task {} failed", a)), "{}", error);

    let report = h.runtime.barrier(APP);
    let failed: Vec<_> = report.failures.iter().map(|failure| failure.task_id).collect();
    assert_eq!(failed, vec![a, b]);
    assert!(!report.is_success());
}

#[test]
fn test_reader_of_failed_version_is_poisoned_at_submission() {
    let h = harness();
    let a = h.runtime.submit_task(failing_writer("x", OnFailure::Fail)).unwrap();
    h.executor.fail(a, "failed").unwrap();

    let b = h.runtime.submit_task(reader("x")).unwrap();
    assert_eq!(h.runtime.status(b).unwrap(), TaskStatus::Failed);
    assert!(h.executor.submitted_ids().is_empty());
}

#[test]
fn test_poisoned_task_honours_its_own_ignore_policy() {
    let h = harness();
    let a = h.runtime.submit_task(failing_writer("x", OnFailure::Fail)).unwrap();
    let b = h
        .runtime
        .submit_task(reader("x").with_on_failure(OnFailure::Ignore))
        .unwrap();

    h.executor.fail(a, "failed").unwrap();
    assert_eq!(h.runtime.status(b).unwrap(), TaskStatus::Finished);
    assert_eq!(h.runtime.stats().ignored, 1);
}

#[test]
fn test_ignore_policy_releases_readers() {
    let h = harness();
    let first = h.runtime.submit_task(writer("x")).unwrap();
    h.executor.succeed(first).unwrap();

    let a = h.runtime.submit_task(failing_writer("x", OnFailure::Ignore)).unwrap();
    let b = h.runtime.submit_task(reader("x")).unwrap();
    h.executor.fail(a, "failed").unwrap();

    assert_eq!(h.runtime.status(a).unwrap(), TaskStatus::Finished);
    assert_eq!(h.executor.submitted_ids(), vec![b]);

    // The ignored version carries the previous content
    let dispatched = h.executor.submitted().remove(0);
    let read = dispatched.parameters[0].read.clone().unwrap();
    assert_eq!(read.number, 1);
    assert_eq!(read.location.path().unwrap(), &h.dir.path().join("d1v0"));

    let ignored = h
        .runtime
        .events()
        .into_iter()
        .any(|event| matches!(event.event, RuntimeEvent::FailureIgnored { task_id, .. } if task_id == a));
    assert!(ignored);
}

#[test]
fn test_retry_takes_over_graph_position() {
    let h = harness();
    let a = h.runtime.submit_task(writer("x")).unwrap();
    let b = h.runtime.submit_task(reader("x")).unwrap();

    h.executor.fail(a, "failed").unwrap();
    let retry = h.runtime.latest_attempt(a);
    assert_ne!(retry, a);

    let snapshot = h.runtime.task(a).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.superseded_by, Some(retry));
    let retried = h.runtime.task(retry).unwrap();
    assert_eq!(retried.attempt, 1);
    assert_eq!(retried.retry_of, Some(a));
    assert_eq!(h.executor.submitted_ids(), vec![retry]);

    // New submissions depend on the retry, not on the failed attempt
    let c = h.runtime.submit_task(reader("x")).unwrap();
    assert_eq!(h.runtime.task(c).unwrap().predecessors, vec![retry]);

    h.executor.succeed(retry).unwrap();
    assert_eq!(h.executor.submitted_ids(), vec![b, c]);
    h.executor.succeed(b).unwrap();
    h.executor.succeed(c).unwrap();

    let report = h.runtime.barrier(APP);
    assert!(report.is_success());
    assert_eq!(h.runtime.stats().retried, 1);
}

#[test]
fn test_retry_escalates_to_fail_after_limit() {
    let h = harness_with(|config| config.with_max_retries(1));
    let a = h.runtime.submit_task(writer("x")).unwrap();
    let b = h.runtime.submit_task(reader("x")).unwrap();

    h.executor.fail(a, "failed").unwrap();
    let retry = h.runtime.latest_attempt(a);
    h.executor.fail(retry, "failed").unwrap();

    assert_eq!(h.runtime.latest_attempt(a), retry);
    assert_eq!(h.runtime.status(retry).unwrap(), TaskStatus::Failed);
    // A retrying reader whose input failed is not retried
    assert_eq!(h.runtime.status(b).unwrap(), TaskStatus::Failed);

    let report = h.runtime.barrier(APP);
    let failed: Vec<_> = report.failures.iter().map(|failure| failure.task_id).collect();
    assert_eq!(failed, vec![retry, b]);
}

#[test]
fn test_cancel_application_tasks() {
    let h = harness();
    let a = h.runtime.submit_task(writer("x")).unwrap();
    let b = h.runtime.submit_task(reader("x")).unwrap();
    let other = h
        .runtime
        .submit_task(TaskSpec::new(2, "work"))
        .unwrap();

    let requested = h.runtime.cancel_application_tasks(APP);
    assert_eq!(requested, 1);
    assert_eq!(h.runtime.status(b).unwrap(), TaskStatus::Cancelled);
    assert!(h.runtime.task(a).unwrap().cancel_requested);
    assert_eq!(h.executor.cancel_requests(), vec![h.executor.handle_of(a).unwrap()]);

    // Cooperative: the executor decides how the running task ends
    h.executor.complete(a, TaskOutcome::Cancelled).unwrap();
    assert_eq!(h.runtime.status(a).unwrap(), TaskStatus::Cancelled);
    assert_eq!(h.runtime.status(other).unwrap(), TaskStatus::Running);

    let report = h.runtime.barrier(APP);
    assert_eq!(report.waited, 0);
    assert!(report.is_success());
}

#[test]
fn test_failure_after_cancel_request_is_not_retried() {
    let h = harness();
    let a = h.runtime.submit_task(failing_writer("x", OnFailure::Retry)).unwrap();
    let b = h.runtime.submit_task(reader("x")).unwrap();

    assert_eq!(h.runtime.cancel_application_tasks(APP), 1);
    h.executor.fail(a, "interrupted").unwrap();

    assert_eq!(h.runtime.latest_attempt(a), a);
    assert_eq!(h.runtime.status(a).unwrap(), TaskStatus::Cancelled);
    assert_eq!(h.runtime.status(b).unwrap(), TaskStatus::Cancelled);
    assert!(h.executor.submitted_ids().is_empty());
    assert_eq!(h.runtime.stats().retried, 0);

    let report = h.runtime.barrier(APP);
    assert_eq!(report.waited, 0);
    assert!(report.is_success());
}

#[test]
fn test_failure_propagates_down_a_long_chain() {
    const LENGTH: usize = 3000;
    let h = harness();
    let first = h.runtime.submit_task(failing_writer("x", OnFailure::Fail)).unwrap();
    let mut chain = vec![first];
    for _ in 0..LENGTH {
        let id = h
            .runtime
            .submit_task(updater("x").with_on_failure(OnFailure::Fail))
            .unwrap();
        chain.push(id);
    }

    h.executor.fail(first, "failed").unwrap();

    assert!(h.executor.submitted_ids().is_empty());
    assert_eq!(h.runtime.status(chain[LENGTH]).unwrap(), TaskStatus::Failed);
    let report = h.runtime.barrier(APP);
    let failed: Vec<_> = report.failures.iter().map(|failure| failure.task_id).collect();
    assert_eq!(failed, chain);
}

#[test]
fn test_submission_concurrent_with_completion() {
    const TASKS: usize = 300;
    let names = ["a", "b", "c"];
    let h = harness();
    let stop = Arc::new(AtomicBool::new(false));

    let completer = {
        let executor = h.executor.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut completed = 0;
            loop {
                let ids = executor.submitted_ids();
                if ids.is_empty() {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    thread::yield_now();
                    continue;
                }
                for id in ids {
                    executor.succeed(id).unwrap();
                    completed += 1;
                }
            }
            completed
        })
    };

    let mut submitted = Vec::with_capacity(TASKS);
    for i in 0..TASKS {
        let name = names[i % names.len()];
        let spec = match (i / names.len()) % 3 {
            0 => writer(name),
            1 => reader(name),
            _ => updater(name),
        };
        submitted.push(h.runtime.submit_task(spec).unwrap());
    }

    let report = h.runtime.barrier(APP);
    stop.store(true, Ordering::Release);
    assert_eq!(completer.join().unwrap(), TASKS);
    assert!(report.is_success());
    for id in &submitted {
        assert_eq!(h.runtime.status(*id).unwrap(), TaskStatus::Finished);
    }

    let mut finished = HashMap::new();
    let mut running = HashMap::new();
    for event in h.runtime.events() {
        match event.event {
            RuntimeEvent::TaskFinished { task_id } => {
                finished.insert(task_id, event.sequence);
            }
            RuntimeEvent::TaskRunning { task_id, .. } => {
                running.insert(task_id, event.sequence);
            }
            _ => {}
        }
    }

    for name in names {
        let versions = h.runtime.versions(&DataId::file(name));
        for (index, version) in versions.iter().enumerate() {
            let Producer::Task(producer) = version.producer else {
                continue;
            };
            // Readers start after the version is produced
            for reader in version.readers.iter().filter(|reader| **reader != producer) {
                assert!(finished[&producer] < running[reader], "{} read {} early", reader, name);
            }
            // Writers start after every reader of the version they replace
            if let Some(previous) = index.checked_sub(1).map(|i| &versions[i]) {
                for reader in previous.readers.iter().filter(|reader| **reader != producer) {
                    assert!(finished[reader] < running[&producer], "{} overwrote {} early", producer, name);
                }
            }
        }
    }
}

#[test]
fn test_double_completion_is_an_invariant_violation() {
    let h = harness();
    let a = h.runtime.submit_task(writer("x")).unwrap();
    h.executor.succeed(a).unwrap();

    let err = h.runtime.on_completion(a, TaskOutcome::Success).unwrap_err();
    assert!(matches!(err, RuntimeError::InvariantViolation(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_rejected_submissions_leave_no_task() {
    let h = harness();
    let err = h.runtime.submit_task(TaskSpec::new(APP, "missing")).unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownCoreElement(_)));

    let err = h
        .runtime
        .submit_task(TaskSpec::new(APP, "work").with_parameter(Parameter::file(Direction::In, "")))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidTask(_)));
    assert_eq!(h.runtime.stats().submitted, 0);
}

#[test]
fn test_barrier_new_seals_application() {
    let h = harness();
    let a = h.runtime.submit_task(writer("x")).unwrap();
    h.executor.succeed(a).unwrap();

    let report = h.runtime.barrier_new(APP, true);
    assert_eq!(report.waited, 0);
    let err = h.runtime.submit_task(reader("x")).unwrap_err();
    assert!(matches!(err, RuntimeError::ApplicationSealed(APP)));
}

#[test]
fn test_shutdown_rejects_new_work() {
    let h = harness();
    h.runtime.shutdown();
    assert!(h.runtime.is_shutdown());
    let err = h.runtime.submit_task(writer("x")).unwrap_err();
    assert!(matches!(err, RuntimeError::SystemShutdown));
}

#[test]
fn test_lifecycle_events_in_order() {
    let h = harness();
    let a = h.runtime.submit_task(writer("x")).unwrap();
    h.executor.succeed(a).unwrap();
    h.runtime.emit_event(42, 7);

    let codes: Vec<_> = h.runtime.events().iter().map(|event| event.event.code()).collect();
    assert_eq!(codes, vec![1, 2, 3, 4, 42]);
    let sequences: Vec<_> = h.runtime.events().iter().map(|event| event.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);

    let json = h.runtime.events_json().unwrap();
    assert!(json.contains("\"type\": \"TaskSubmitted\""));
}

#[test]
fn test_dot_export_and_release() {
    let h = harness();
    let a = h.runtime.submit_task(writer("x")).unwrap();
    let b = h.runtime.submit_task(reader("x")).unwrap();
    let dot = h.runtime.to_dot();
    assert!(dot.contains("flow"), "{}", dot);

    assert_eq!(h.runtime.release_application(APP), 0);
    h.executor.succeed(a).unwrap();
    h.executor.succeed(b).unwrap();
    assert_eq!(h.runtime.release_application(APP), 2);
    assert!(matches!(
        h.runtime.task(a),
        Err(RuntimeError::UnknownTask(_))
    ));
    assert_eq!(h.runtime.stats().tracked, 0);
}
