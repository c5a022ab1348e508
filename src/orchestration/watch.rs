//! Filesystem-triggered reruns.
//!
//! The WatchController subscribes to change notifications under a root
//! directory, matches changed paths against glob bindings and re-enters the
//! [`Orchestrator`] for the union of the bound tasks. Rapid changes are
//! debounced into a single run, runs never overlap, and changes that arrive
//! while a run is in progress coalesce into exactly one follow-up run.

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::orchestration::orchestrator::Orchestrator;
use crate::orchestration::report::RunReport;
use crate::{slog, slog_debug, slog_trace, slog_warn};
use glob::{MatchOptions, Pattern};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default debounce window in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Lifecycle of a watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Created, not yet subscribed.
    Idle,
    /// Waiting for a matching change.
    Watching,
    /// A matching change arrived; waiting for the debounce window to pass.
    Triggered,
    /// A run is in progress.
    Running,
    /// Terminal.
    Stopped,
}

impl std::fmt::Display for WatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatchState::Idle => "idle",
            WatchState::Watching => "watching",
            WatchState::Triggered => "triggered",
            WatchState::Running => "running",
            WatchState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// A glob pattern and the tasks it re-runs.
#[derive(Debug, Clone)]
pub struct WatchBinding {
    pub pattern: Pattern,
    pub tasks: Vec<TaskId>,
}

impl WatchBinding {
    pub fn new<I, S>(glob: &str, tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        Ok(Self {
            pattern: Pattern::new(glob)?,
            tasks: tasks.into_iter().map(Into::into).collect(),
        })
    }

    /// Match a path relative to the watch root. `*` never crosses a `/`.
    pub fn matches(&self, relative: &Path) -> bool {
        self.pattern.matches_path_with(relative, MATCH_OPTIONS)
    }
}

/// Notifications about watch-triggered runs.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A debounced batch of changes is about to run `tasks`.
    RunStarted { tasks: Vec<TaskId> },
    /// The run finished; its report may still contain failures.
    RunCompleted { report: RunReport },
    /// The run was rejected (resolution error, or a fail-fast abort).
    RunFailed { error: String },
    Stopped,
}

/// Totals for a finished watch session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub runs: usize,
    pub failed_runs: usize,
}

/// Builds and starts a watch session.
pub struct WatchController {
    orchestrator: Orchestrator,
    root: PathBuf,
    bindings: Vec<WatchBinding>,
    debounce: Duration,
    event_tx: Option<mpsc::UnboundedSender<WatchEvent>>,
}

impl WatchController {
    pub fn new(orchestrator: Orchestrator, root: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            root: root.into(),
            bindings: Vec::new(),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            event_tx: None,
        }
    }

    pub fn with_binding(mut self, binding: WatchBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_bindings(mut self, bindings: impl IntoIterator<Item = WatchBinding>) -> Self {
        self.bindings.extend(bindings);
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<WatchEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Every bound task must be registered.
    fn validate(&self) -> Result<()> {
        if self.bindings.is_empty() {
            return Err(Error::Validation("no watch bindings".to_string()));
        }
        for binding in &self.bindings {
            for id in &binding.tasks {
                self.orchestrator.registry().get(id)?;
            }
        }
        Ok(())
    }

    /// Subscribe to filesystem changes under the root and start the loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<WatchHandle> {
        self.validate()?;
        let root = self.root.canonicalize()?;
        let (change_tx, change_rx) = mpsc::unbounded_channel();

        let watcher_root = root.clone();
        let watcher_tx = change_tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    match event.kind {
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
                        _ => return,
                    }
                    slog_trace!("fs event {:?} {:?}", event.kind, event.paths);
                    for path in event.paths {
                        let relative = path
                            .strip_prefix(&watcher_root)
                            .map(Path::to_path_buf)
                            .unwrap_or(path);
                        let _ = watcher_tx.send(relative);
                    }
                }
                Err(e) => slog_warn!("watch error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        slog!("watching {} ({} bindings)", root.display(), self.bindings.len());

        Ok(self.spawn(change_tx, change_rx, Some(watcher)))
    }

    /// Start without a filesystem subscription. Changes arrive only through
    /// [`WatchHandle::notify_change`].
    pub fn start_manual(self) -> Result<WatchHandle> {
        self.validate()?;
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        Ok(self.spawn(change_tx, change_rx, None))
    }

    fn spawn(
        self,
        change_tx: mpsc::UnboundedSender<PathBuf>,
        change_rx: mpsc::UnboundedReceiver<PathBuf>,
        watcher: Option<RecommendedWatcher>,
    ) -> WatchHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = tokio::sync::watch::channel(WatchState::Idle);
        let task = tokio::spawn(self.run_loop(change_rx, state_tx, cancel.clone()));
        WatchHandle {
            cancel,
            changes: change_tx,
            state: state_rx,
            watcher,
            task,
        }
    }

    /// Add the tasks bound to `path` to `pending`, keeping first-seen order.
    /// Returns whether any binding matched.
    fn collect(&self, path: &Path, pending: &mut Vec<TaskId>) -> bool {
        let mut matched = false;
        for binding in self.bindings.iter().filter(|b| b.matches(path)) {
            matched = true;
            slog_debug!("change {} matched {}", path.display(), binding.pattern);
            for id in &binding.tasks {
                if !pending.contains(id) {
                    pending.push(id.clone());
                }
            }
        }
        matched
    }

    fn emit(&self, event: WatchEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    async fn run_loop(
        self,
        mut changes: mpsc::UnboundedReceiver<PathBuf>,
        state: tokio::sync::watch::Sender<WatchState>,
        cancel: CancellationToken,
    ) -> WatchSummary {
        let set_state = |next: WatchState| {
            slog_debug!("watch state -> {}", next);
            state.send_replace(next);
        };
        let mut summary = WatchSummary::default();
        let mut pending: Vec<TaskId> = Vec::new();

        'watch: loop {
            if pending.is_empty() {
                set_state(WatchState::Watching);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(path) => {
                            self.collect(&path, &mut pending);
                        }
                        None => break,
                    },
                }
                if pending.is_empty() {
                    continue;
                }
            }

            // Only matching changes push the deadline back.
            set_state(WatchState::Triggered);
            let deadline = tokio::time::sleep_until(Instant::now() + self.debounce);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'watch,
                    _ = &mut deadline => break,
                    change = changes.recv() => match change {
                        Some(path) => {
                            if self.collect(&path, &mut pending) {
                                deadline.as_mut().reset(Instant::now() + self.debounce);
                            }
                        }
                        None => break,
                    },
                }
            }

            set_state(WatchState::Running);
            let tasks = std::mem::take(&mut pending);
            slog!("watch run: {:?}", tasks.iter().map(TaskId::as_str).collect::<Vec<_>>());
            self.emit(WatchEvent::RunStarted {
                tasks: tasks.clone(),
            });
            summary.runs += 1;
            match self.orchestrator.run_many(&tasks).await {
                Ok(report) => {
                    if !report.is_success() {
                        summary.failed_runs += 1;
                    }
                    self.emit(WatchEvent::RunCompleted { report });
                }
                Err(e) => {
                    slog_warn!("watch run failed: {}", e);
                    summary.failed_runs += 1;
                    self.emit(WatchEvent::RunFailed {
                        error: e.to_string(),
                    });
                }
            }

            if cancel.is_cancelled() {
                break;
            }
            // Everything that arrived during the run feeds one follow-up.
            while let Ok(path) = changes.try_recv() {
                self.collect(&path, &mut pending);
            }
        }

        set_state(WatchState::Stopped);
        self.emit(WatchEvent::Stopped);
        slog!("watch stopped after {} runs", summary.runs);
        summary
    }
}

/// Handle to a running watch session.
pub struct WatchHandle {
    cancel: CancellationToken,
    changes: mpsc::UnboundedSender<PathBuf>,
    state: tokio::sync::watch::Receiver<WatchState>,
    watcher: Option<RecommendedWatcher>,
    task: JoinHandle<WatchSummary>,
}

impl WatchHandle {
    /// Current state of the session.
    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<WatchState> {
        self.state.clone()
    }

    /// Report a change to `path` (relative to the watch root).
    pub fn notify_change(&self, path: impl Into<PathBuf>) {
        let _ = self.changes.send(path.into());
    }

    /// Unsubscribe from the filesystem. A run in progress finishes; nothing
    /// new is scheduled.
    pub fn stop(&mut self) {
        self.watcher = None;
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the session to end.
    pub async fn join(self) -> Result<WatchSummary> {
        self.task.await.map_err(|e| Error::TaskJoin(e.to_string()))
    }
}
