//! Filesystem-triggered reruns against a real directory.
//!
//! Notification latency varies by platform, so waits are generous and
//! assertions only rely on ordering, never on exact timing.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use stoke::orchestration::{Orchestrator, WatchBinding, WatchController, WatchEvent, WatchState};
use stoke::TaskId;

use crate::fixtures::{ok_task, registry, Journal, TestProject};

const WAIT: Duration = Duration::from_secs(10);

/// Next run outcome, skipping RunStarted.
async fn next_completion(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a watch run")
            .expect("watch event channel closed");
        if !matches!(event, WatchEvent::RunStarted { .. }) {
            return event;
        }
    }
}

/// Given a binding on `src/**/*.js`
/// When a script under src changes on disk
/// Then the bound task runs
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_change_triggers_run() {
    let project = TestProject::new();
    project.write("src/app/main.js", "// v1");
    let journal = Journal::new();
    let orchestrator = Orchestrator::new(registry(vec![ok_task("js", &journal)]));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut handle = WatchController::new(orchestrator, project.root())
        .with_binding(WatchBinding::new("src/**/*.js", ["js"]).unwrap())
        .with_debounce(Duration::from_millis(50))
        .with_events(tx)
        .start()
        .unwrap();

    // Give the platform watcher a moment to subscribe.
    tokio::time::sleep(Duration::from_millis(200)).await;
    project.write("src/app/main.js", "// v2");

    match next_completion(&mut rx).await {
        WatchEvent::RunCompleted { report } => {
            assert!(report.is_success());
            assert_eq!(report.requested, vec![TaskId::from("js")]);
        }
        other => panic!("expected a completed run, got {other:?}"),
    }
    assert!(journal.starts("js") >= 1);

    handle.stop();
    let summary = timeout(WAIT, handle.join()).await.unwrap().unwrap();
    assert!(summary.runs >= 1);
    assert_eq!(summary.failed_runs, 0);
}

/// Given bindings loaded from the task file
/// When only an unbound file changes
/// Then nothing runs until a bound file changes
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unbound_change_is_ignored() {
    let project = TestProject::new();
    let file = project.task_file(
        r#"
[tasks.styles]

[[watch]]
glob = "src/*.less"
tasks = ["styles"]
"#,
    );
    project.write("src/theme.less", "@c: red;");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut handle = WatchController::new(file.orchestrator().unwrap(), &file.base_dir)
        .with_bindings(file.watch_bindings().unwrap())
        .with_debounce(Duration::from_millis(50))
        .with_events(tx)
        .start()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    project.write("README.md", "# readme");
    project.write("src/nested/deep.less", "@c: blue;");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rx.try_recv().is_err(), "unbound changes must not trigger a run");
    assert_eq!(handle.state(), WatchState::Watching);

    project.write("src/theme.less", "@c: green;");
    match next_completion(&mut rx).await {
        WatchEvent::RunCompleted { report } => {
            assert!(report.outcome("styles").unwrap().is_succeeded());
        }
        other => panic!("expected a completed run, got {other:?}"),
    }

    handle.stop();
    timeout(WAIT, handle.join()).await.unwrap().unwrap();
}

/// After stop the session reaches Stopped and emits a final event.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_ends_session() {
    let project = TestProject::new();
    let journal = Journal::new();
    let orchestrator = Orchestrator::new(registry(vec![ok_task("html", &journal)]));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut handle = WatchController::new(orchestrator, project.root())
        .with_binding(WatchBinding::new("**/*.html", ["html"]).unwrap())
        .with_events(tx)
        .start()
        .unwrap();
    let mut state = handle.subscribe();

    handle.stop();
    assert!(handle.is_stopped());
    timeout(WAIT, state.wait_for(|s| *s == WatchState::Stopped))
        .await
        .unwrap()
        .unwrap();

    let summary = timeout(WAIT, handle.join()).await.unwrap().unwrap();
    assert_eq!(summary.runs, 0);
    assert!(matches!(rx.recv().await, Some(WatchEvent::Stopped)));
    assert_eq!(journal.starts("html"), 0);
}
