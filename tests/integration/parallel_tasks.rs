//! Parallel composition and concurrency limits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stoke::core::{from_async, Task};
use stoke::orchestration::{Orchestrator, RunOptions};

use crate::fixtures::{failing_task, ok_task, recorded_task, registry, Journal};

/// Task that tracks how many actions overlap with it.
fn gauged_task(id: &str, in_flight: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Task {
    let in_flight = Arc::clone(in_flight);
    let peak = Arc::clone(peak);
    Task::new(id).with_action(from_async(move |_ctx| {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }))
}

/// Given three independent 150 ms tasks in a parallel group
/// When the group runs
/// Then they overlap and the run takes far less than their sum
#[tokio::test]
async fn test_parallel_group_overlaps() {
    let journal = Journal::new();
    let delay = Duration::from_millis(150);
    let registry = registry(vec![
        recorded_task("js", &journal, delay, false),
        recorded_task("html", &journal, delay, false),
        recorded_task("styles", &journal, delay, false),
        Task::new("assets")
            .with_deps(["js", "html", "styles"])
            .parallel(),
    ]);

    let started = Instant::now();
    let report = Orchestrator::new(registry)
        .with_options(RunOptions {
            max_parallel: 4,
            ..RunOptions::default()
        })
        .run(&"assets".into())
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(started.elapsed() < Duration::from_millis(400));
    // All three started before any finished.
    let first_end = ["js", "html", "styles"]
        .iter()
        .map(|id| journal.index_of(&format!("end:{id}")))
        .min()
        .unwrap();
    for id in ["js", "html", "styles"] {
        assert!(journal.index_of(&format!("start:{id}")) < first_end);
    }
}

/// Given eight independent tasks and max_parallel 3
/// When they run
/// Then no more than three actions are ever in flight
#[tokio::test]
async fn test_max_parallel_bounds_in_flight() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let ids: Vec<String> = (0..8).map(|i| format!("t{i}")).collect();
    let mut tasks: Vec<Task> = ids
        .iter()
        .map(|id| gauged_task(id, &in_flight, &peak))
        .collect();
    tasks.push(Task::new("all").with_deps(ids.iter().cloned()).parallel());

    let report = Orchestrator::new(registry(tasks))
        .with_options(RunOptions {
            max_parallel: 3,
            ..RunOptions::default()
        })
        .run(&"all".into())
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 9);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
}

/// With max_parallel 1 a parallel group still completes, one at a time.
#[tokio::test]
async fn test_max_parallel_one_serializes() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let registry = registry(vec![
        gauged_task("a", &in_flight, &peak),
        gauged_task("b", &in_flight, &peak),
        gauged_task("c", &in_flight, &peak),
        Task::new("all").with_deps(["a", "b", "c"]).parallel(),
    ]);

    let report = Orchestrator::new(registry)
        .with_options(RunOptions {
            max_parallel: 1,
            ..RunOptions::default()
        })
        .run(&"all".into())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

/// Given a parallel group with one failing member
/// When it runs
/// Then the siblings still finish, and only the composing task is skipped
#[tokio::test]
async fn test_parallel_siblings_finish_after_failure() {
    let journal = Journal::new();
    let registry = registry(vec![
        failing_task("lint", &journal),
        recorded_task("test", &journal, Duration::from_millis(60), false),
        ok_task("typecheck", &journal),
        Task::new("check")
            .with_deps(["lint", "test", "typecheck"])
            .parallel(),
    ]);

    let report = Orchestrator::new(registry)
        .run(&"check".into())
        .await
        .unwrap();

    assert!(report.outcome("lint").unwrap().is_failed());
    assert!(report.outcome("test").unwrap().is_succeeded());
    assert!(report.outcome("typecheck").unwrap().is_succeeded());
    assert!(report.outcome("check").unwrap().is_skipped());
    assert!(journal.contains("end:test"));
}

/// A task waits for every member of the parallel group it depends on.
#[tokio::test]
async fn test_dependent_joins_whole_group() {
    let journal = Journal::new();
    let registry = registry(vec![
        recorded_task("fast", &journal, Duration::from_millis(5), false),
        recorded_task("slow", &journal, Duration::from_millis(80), false),
        Task::new("group").with_deps(["fast", "slow"]).parallel(),
        ok_task("package", &journal).with_deps(["group"]),
    ]);

    let report = Orchestrator::new(registry)
        .run(&"package".into())
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(journal.index_of("end:slow") < journal.index_of("start:package"));
    assert!(journal.index_of("end:fast") < journal.index_of("start:package"));
}

/// Requesting several roots at once runs their shared dependency once.
#[tokio::test]
async fn test_run_many_shares_dependencies() {
    let journal = Journal::new();
    let registry = registry(vec![
        ok_task("clean", &journal),
        ok_task("js", &journal).with_deps(["clean"]),
        ok_task("html", &journal).with_deps(["clean"]),
    ]);

    let report = Orchestrator::new(registry)
        .run_many(&["js".into(), "html".into()])
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 3);
    assert_eq!(journal.starts("clean"), 1);
    assert!(journal.index_of("end:clean") < journal.index_of("start:js"));
    assert!(journal.index_of("end:clean") < journal.index_of("start:html"));
}
