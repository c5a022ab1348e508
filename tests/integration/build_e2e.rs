//! End-to-end runs through the orchestrator.

use std::time::Duration;

use stoke::core::{ErrorPolicy, Task};
use stoke::error::exit_code;
use stoke::orchestration::{Orchestrator, RunOptions, TaskOutcome};
use stoke::Error;

use crate::fixtures::{failing_task, ok_task, recorded_task, registry, web_extension, Journal};

/// Given a <- b, a <- c, (b, c) <- d with b failing
/// When d runs
/// Then a and c succeed, b fails, d is skipped and never invoked
#[tokio::test]
async fn test_failed_dependency_skips_dependent() {
    let journal = Journal::new();
    let registry = registry(vec![
        ok_task("a", &journal),
        failing_task("b", &journal).with_deps(["a"]),
        ok_task("c", &journal).with_deps(["a"]),
        ok_task("d", &journal).with_deps(["b", "c"]).parallel(),
    ]);

    let report = Orchestrator::new(registry).run(&"d".into()).await.unwrap();

    assert_eq!(report.run_count(), 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.skipped(), 1);
    assert!(!journal.contains("start:d"));

    let (first, reason) = report.first_failure().unwrap();
    assert_eq!(first.as_str(), "b");
    assert_eq!(reason.to_string(), "b failed");
    assert_eq!(report.exit_code(), exit_code::TASK_FAILED);

    let text = report.to_string();
    assert!(text.contains("skipped: dependency b failed"));
}

/// Given the web extension graph
/// When release runs
/// Then every task runs exactly once and series/parallel order holds
#[tokio::test]
async fn test_release_pipeline_order() {
    let journal = Journal::new();
    let orchestrator = Orchestrator::new(web_extension(&journal, &[]));

    let report = orchestrator.run(&"release".into()).await.unwrap();
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.tasks.len(), 12);

    for id in ["clean", "staticJS", "copy", "js", "html", "styles", "getVersion", "zip"] {
        assert_eq!(journal.starts(id), 1, "{id} should run once");
    }

    // prep = series(clean, copy): copy and its dependency wait for clean.
    assert!(journal.index_of("end:clean") < journal.index_of("start:staticJS"));
    assert!(journal.index_of("end:staticJS") < journal.index_of("start:copy"));
    // build = series(prep, assets): the parallel group waits for prep.
    for id in ["js", "html", "styles"] {
        assert!(journal.index_of("end:copy") < journal.index_of(&format!("start:{id}")));
    }
    // release = series(build, getVersion, zip)
    for id in ["js", "html", "styles"] {
        assert!(journal.index_of(&format!("end:{id}")) < journal.index_of("start:getVersion"));
    }
    assert!(journal.index_of("end:getVersion") < journal.index_of("start:zip"));
}

/// Given a failing step early in a sequential chain
/// When release runs with the default policy
/// Then the rest of the chain is skipped and blamed on that step
#[tokio::test]
async fn test_sequential_chain_short_circuits() {
    let journal = Journal::new();
    let orchestrator = Orchestrator::new(web_extension(&journal, &["clean"]));

    let report = orchestrator.run(&"release".into()).await.unwrap();

    assert!(report.outcome("clean").unwrap().is_failed());
    for id in ["copy", "js", "build", "getVersion", "zip", "release"] {
        assert!(
            matches!(
                report.outcome(id).unwrap(),
                TaskOutcome::Skipped { blocked_by } if blocked_by.as_str() == "clean"
            ),
            "{id} should be skipped because of clean"
        );
    }
    assert_eq!(journal.starts("zip"), 0);
    assert_eq!(journal.starts("js"), 0);
}

/// Given a commit chain marked `continue`
/// When one step fails
/// Then the later steps still run, but the composing task is skipped
#[tokio::test]
async fn test_continue_chain_runs_remaining_steps() {
    let journal = Journal::new();
    let registry = registry(vec![
        failing_task("add", &journal),
        ok_task("commit", &journal),
        ok_task("tag", &journal),
        ok_task("push", &journal),
        Task::new("publish")
            .with_deps(["add", "commit", "tag", "push"])
            .with_error_policy(ErrorPolicy::Continue),
    ]);

    let report = Orchestrator::new(registry)
        .run(&"publish".into())
        .await
        .unwrap();

    for id in ["commit", "tag", "push"] {
        assert!(report.outcome(id).unwrap().is_succeeded(), "{id}");
    }
    assert!(journal.index_of("end:commit") < journal.index_of("start:tag"));
    assert!(report.outcome("publish").unwrap().is_skipped());
}

/// Given fail_fast
/// When a task fails
/// Then the call returns the failure as an error and starts nothing new
#[tokio::test]
async fn test_fail_fast_returns_error() {
    let journal = Journal::new();
    let orchestrator =
        Orchestrator::new(web_extension(&journal, &["html"])).with_options(RunOptions {
            fail_fast: true,
            ..RunOptions::default()
        });

    let err = orchestrator.run(&"release".into()).await.unwrap_err();
    match &err {
        Error::ActionFailure { task, .. } => assert_eq!(task.as_str(), "html"),
        other => panic!("expected ActionFailure, got {other:?}"),
    }
    assert_eq!(err.exit_code(), exit_code::TASK_FAILED);
    assert!(!journal.contains("start:getVersion"));
    assert!(!journal.contains("start:zip"));
}

/// Given a task slower than its timeout
/// When it runs
/// Then it is reported TimedOut and its dependents are skipped
#[tokio::test]
async fn test_timeout_is_reported() {
    let journal = Journal::new();
    let registry = registry(vec![
        recorded_task("slow", &journal, Duration::from_secs(5), false)
            .with_timeout(Duration::from_millis(30)),
        ok_task("after", &journal).with_deps(["slow"]),
    ]);

    let report = Orchestrator::new(registry)
        .run(&"after".into())
        .await
        .unwrap();

    match report.outcome("slow").unwrap() {
        TaskOutcome::Failed { reason } => {
            assert!(reason.to_string().contains("timed out"), "{reason}");
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert!(report.outcome("after").unwrap().is_skipped());
    assert!(report.elapsed < Duration::from_secs(5));
}

/// Resolution errors abort before anything runs.
#[tokio::test]
async fn test_resolution_errors_abort() {
    let journal = Journal::new();
    let registry = registry(vec![
        ok_task("lint", &journal),
        Task::new("ci").with_deps(["lint", "typecheck"]),
        Task::new("loop_a").with_deps(["lint", "loop_b"]),
        Task::new("loop_b").with_deps(["loop_a"]),
    ]);
    let orchestrator = Orchestrator::new(registry);

    let err = orchestrator.run(&"ci".into()).await.unwrap_err();
    assert!(matches!(
        &err,
        Error::UnknownDependency { task, dependency }
            if task.as_str() == "ci" && dependency.as_str() == "typecheck"
    ));
    assert_eq!(err.exit_code(), exit_code::RESOLUTION);

    let err = orchestrator.run(&"loop_a".into()).await.unwrap_err();
    assert!(matches!(err, Error::CyclicDependency { .. }));

    let err = orchestrator.run(&"deploy".into()).await.unwrap_err();
    assert!(matches!(err, Error::UnknownTask(_)));

    assert!(journal.entries().is_empty());
}

/// Running the same task twice runs its action twice: nothing is cached.
#[tokio::test]
async fn test_invocations_are_independent() {
    let journal = Journal::new();
    let orchestrator = Orchestrator::new(registry(vec![ok_task("html", &journal)]));

    orchestrator.run(&"html".into()).await.unwrap();
    orchestrator.run(&"html".into()).await.unwrap();
    assert_eq!(journal.starts("html"), 2);
}

/// The JSON report names every task with its outcome.
#[tokio::test]
async fn test_report_serializes() {
    let journal = Journal::new();
    let registry = registry(vec![
        failing_task("styles", &journal),
        Task::new("build").with_deps(["styles"]),
    ]);

    let report = Orchestrator::new(registry)
        .run(&"build".into())
        .await
        .unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["first_failure"], "styles");
    assert_eq!(json["tasks"][0]["id"], "styles");
    assert_eq!(json["tasks"][0]["status"], "failed");
    assert_eq!(json["tasks"][0]["reason"], "styles failed");
    assert_eq!(json["tasks"][1]["status"], "skipped");
    assert_eq!(json["tasks"][1]["blocked_by"], "styles");
}
