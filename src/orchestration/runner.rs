//! Runs a single task's action and normalises how it ended.

use crate::core::{Action, ActionContext, Task};
use crate::orchestration::report::{Failure, TaskOutcome, TaskReport};
use crate::{slog_debug, slog_warn};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Invokes actions.
///
/// Each action runs in its own tokio task, so an action that panics (or
/// blocks inside its `call`) is reported as a failure instead of tearing
/// down the scheduler. A timed-out action is told to stop through its
/// cancellation token and then left alone: it is never aborted.
#[derive(Debug, Clone, Default)]
pub struct TaskRunner {
    default_timeout: Option<Duration>,
}

impl TaskRunner {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }

    /// Effective timeout for `task`.
    pub fn timeout_for(&self, task: &Task) -> Option<Duration> {
        task.timeout.or(self.default_timeout)
    }

    /// Run `task` once. Never fails: every ending is captured in the report.
    pub async fn run(&self, task: &Task, ctx: ActionContext) -> TaskReport {
        let started = Instant::now();
        let outcome = match &task.action {
            None => TaskOutcome::Succeeded,
            Some(action) => self.invoke(task, Arc::clone(action), ctx).await,
        };
        let elapsed = started.elapsed();
        slog_debug!("task={} outcome={} elapsed={:?}", task.id, outcome, elapsed);
        TaskReport::new(task.id.clone(), outcome, elapsed)
    }

    async fn invoke(&self, task: &Task, action: Arc<dyn Action>, ctx: ActionContext) -> TaskOutcome {
        let cancel = ctx.cancel.clone();
        let handle = tokio::spawn(async move { action.call(ctx).await });

        let joined = match self.timeout_for(task) {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    slog_warn!("task={} timed out after {:?}", task.id, limit);
                    cancel.cancel();
                    return TaskOutcome::Failed {
                        reason: Failure::TimedOut(limit),
                    };
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(())) => TaskOutcome::Succeeded,
            Ok(Err(err)) => TaskOutcome::Failed {
                reason: Failure::Action(Arc::from(err)),
            },
            Err(join_err) if join_err.is_panic() => TaskOutcome::Failed {
                reason: Failure::Panicked(panic_message(join_err.into_panic())),
            },
            Err(join_err) => TaskOutcome::Failed {
                reason: Failure::Action(Arc::new(join_err)),
            },
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
