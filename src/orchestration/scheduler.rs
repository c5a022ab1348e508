//! Scheduler for plan execution.
//!
//! The Scheduler walks an [`ExecutionPlan`], dispatching every task whose
//! predecessors have settled to the [`TaskRunner`], up to a concurrency
//! limit. Tasks blocked by a failure upstream are skipped without being
//! invoked. Outcomes are aggregated into a [`RunReport`].

use crate::core::{EdgeKind, ErrorPolicy, ExecutionPlan, TaskId, TaskStatus};
use crate::orchestration::context::{RunContext, RunOptions};
use crate::orchestration::report::{RunReport, TaskOutcome, TaskReport};
use crate::orchestration::runner::TaskRunner;
use crate::{slog, slog_debug, slog_warn};
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::graph::NodeIndex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These events allow external components (like the CLI progress output) to
/// react to task state changes without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A task's action was dispatched.
    TaskStarted { task_id: TaskId },
    /// A task completed successfully.
    TaskSucceeded { task_id: TaskId, elapsed: Duration },
    /// A task failed, panicked or timed out.
    TaskFailed { task_id: TaskId, error: String },
    /// A task was not invoked because `blocked_by` failed.
    TaskSkipped { task_id: TaskId, blocked_by: TaskId },
    /// Every task in the plan has settled.
    AllTasksComplete {
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

/// Whether a pending task can start.
#[derive(Debug, PartialEq, Eq)]
enum Readiness {
    /// Some predecessor has not settled yet.
    Waiting,
    /// Every predecessor settled and none blocks the task.
    Ready,
    /// A predecessor did not succeed; carries the failed task at the root.
    Blocked(TaskId),
}

/// Drives one plan to completion.
pub struct Scheduler {
    runner: TaskRunner,
    options: RunOptions,
    /// Channel for emitting scheduler events.
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Scheduler {
    pub fn new(runner: TaskRunner, options: RunOptions) -> Self {
        Self {
            runner,
            options,
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>) -> Self {
        self.event_tx = event_tx;
        self
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Policy a sequence edge applies when the step before it did not succeed.
    fn effective_policy(&self, policy: Option<ErrorPolicy>) -> ErrorPolicy {
        policy.unwrap_or(if self.options.continue_on_error {
            ErrorPolicy::Continue
        } else {
            ErrorPolicy::FailFast
        })
    }

    fn readiness(&self, plan: &ExecutionPlan, index: NodeIndex, ctx: &RunContext) -> Readiness {
        let predecessors = plan.predecessors(index);
        let mut statuses = Vec::with_capacity(predecessors.len());
        for (pred, kind) in predecessors {
            let status = ctx.status(&plan.task_at(pred).id);
            if !status.is_settled() {
                return Readiness::Waiting;
            }
            statuses.push((pred, kind, status));
        }

        for (pred, kind, status) in statuses {
            let cause = match status {
                TaskStatus::Succeeded => continue,
                TaskStatus::Skipped { blocked_by } => blocked_by,
                _ => plan.task_at(pred).id.clone(),
            };
            let blocks = match kind {
                EdgeKind::Dependency => true,
                EdgeKind::Sequence { policy } => {
                    self.effective_policy(policy) == ErrorPolicy::FailFast
                }
            };
            if blocks {
                return Readiness::Blocked(cause);
            }
        }
        Readiness::Ready
    }

    fn skip(
        &self,
        ctx: &mut RunContext,
        reports: &mut HashMap<NodeIndex, TaskReport>,
        index: NodeIndex,
        id: &TaskId,
        blocked_by: TaskId,
    ) {
        slog_debug!("skip task={} blocked_by={}", id, blocked_by);
        ctx.mark_skipped(id, blocked_by.clone());
        self.emit(SchedulerEvent::TaskSkipped {
            task_id: id.clone(),
            blocked_by: blocked_by.clone(),
        });
        reports.insert(index, TaskReport::skipped(id.clone(), blocked_by));
    }

    /// Run every task of `plan`, recording state in `ctx`.
    ///
    /// Returns once every task has settled. Action failures are recorded in
    /// the report, never returned as errors.
    pub async fn execute(&self, plan: &ExecutionPlan, ctx: &mut RunContext) -> RunReport {
        let started = Instant::now();
        let max_parallel = self.options.max_parallel.max(1);
        let mut reports: HashMap<NodeIndex, TaskReport> = HashMap::new();
        let mut pending: Vec<NodeIndex> = plan.node_indices().collect();
        let mut running = FuturesUnordered::new();
        let mut first_failure: Option<TaskId> = None;

        slog!(
            "run={} executing {} tasks (max_parallel={})",
            ctx.id.short(),
            plan.len(),
            max_parallel
        );

        loop {
            let halted_by = if self.options.fail_fast {
                first_failure.clone()
            } else {
                None
            };

            // Plan order is topological, so a skip settles its dependents
            // within the same pass.
            let mut still_pending = Vec::with_capacity(pending.len());
            for index in pending.drain(..) {
                let task = plan.task_at(index);
                if let Some(cause) = &halted_by {
                    self.skip(ctx, &mut reports, index, &task.id, cause.clone());
                    continue;
                }
                match self.readiness(plan, index, ctx) {
                    Readiness::Waiting => still_pending.push(index),
                    Readiness::Blocked(cause) => {
                        self.skip(ctx, &mut reports, index, &task.id, cause);
                    }
                    Readiness::Ready if running.len() < max_parallel => {
                        slog_debug!("dispatch task={}", task.id);
                        ctx.mark_running(&task.id);
                        self.emit(SchedulerEvent::TaskStarted {
                            task_id: task.id.clone(),
                        });
                        let action_ctx = ctx.action_context(task);
                        let runner = &self.runner;
                        running.push(async move { (index, runner.run(task, action_ctx).await) });
                    }
                    Readiness::Ready => still_pending.push(index),
                }
            }
            pending = still_pending;

            let Some((index, report)) = running.next().await else {
                break;
            };

            let id = &plan.task_at(index).id;
            match &report.outcome {
                TaskOutcome::Succeeded => {
                    ctx.mark_succeeded(id);
                    self.emit(SchedulerEvent::TaskSucceeded {
                        task_id: id.clone(),
                        elapsed: report.elapsed,
                    });
                }
                TaskOutcome::Failed { reason } => {
                    slog_warn!("task={} failed: {}", id, reason);
                    ctx.mark_failed(id, reason.clone());
                    first_failure.get_or_insert_with(|| id.clone());
                    self.emit(SchedulerEvent::TaskFailed {
                        task_id: id.clone(),
                        error: reason.to_string(),
                    });
                }
                TaskOutcome::Skipped { .. } => {}
            }
            reports.insert(index, report);
        }

        // Unreachable for an acyclic plan; report leftovers rather than drop them.
        for index in pending {
            let id = plan.task_at(index).id.clone();
            slog_warn!("task={} never became ready", id);
            let cause = first_failure.clone().unwrap_or_else(|| id.clone());
            self.skip(ctx, &mut reports, index, &id, cause);
        }

        let tasks: Vec<TaskReport> = plan
            .node_indices()
            .filter_map(|index| reports.remove(&index))
            .collect();

        let report = RunReport {
            run_id: ctx.id,
            requested: ctx.requested.clone(),
            tasks,
            first_failure,
            elapsed: started.elapsed(),
        };
        slog!(
            "run={} finished: {} succeeded, {} failed, {} skipped",
            ctx.id.short(),
            report.succeeded(),
            report.failed(),
            report.skipped()
        );
        self.emit(SchedulerEvent::AllTasksComplete {
            succeeded: report.succeeded(),
            failed: report.failed(),
            skipped: report.skipped(),
        });
        report
    }
}
