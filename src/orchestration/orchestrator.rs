//! Single entry point: resolve a request, execute it, return the report.

use crate::core::{DependencyResolver, ExecutionPlan, TaskId, TaskRegistry, Vars};
use crate::error::{Error, Result};
use crate::orchestration::context::{RunContext, RunOptions};
use crate::orchestration::report::RunReport;
use crate::orchestration::runner::TaskRunner;
use crate::orchestration::scheduler::{Scheduler, SchedulerEvent};
use crate::{slog, slog_warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Composes the resolver, scheduler and runner over one registry.
///
/// Cloning is cheap: the registry is shared. Every call to [`run`](Self::run)
/// starts from a fresh [`RunContext`] and a fork of the initial variables,
/// so nothing one run does is visible to the next.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    options: RunOptions,
    vars: Vars,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Orchestrator {
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            options: RunOptions::default(),
            vars: Vars::new(),
            event_tx: None,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Initial variables every run starts from.
    pub fn with_vars(mut self, vars: Vars) -> Self {
        self.vars = vars;
        self
    }

    /// Forward scheduler events of every run to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut RunOptions {
        &mut self.options
    }

    /// Resolve `ids` without running anything.
    pub fn plan(&self, ids: &[TaskId]) -> Result<ExecutionPlan> {
        DependencyResolver::new(&self.registry).resolve_many(ids)
    }

    /// Run one task and everything it depends on.
    pub async fn run(&self, id: &TaskId) -> Result<RunReport> {
        self.run_many(std::slice::from_ref(id)).await
    }

    /// Run several tasks in one invocation. Shared dependencies run once.
    ///
    /// # Errors
    /// - Resolution errors (`UnknownTask`, `UnknownDependency`,
    ///   `CyclicDependency`) abort before any action runs.
    /// - With `fail_fast`, the first failure is returned as
    ///   `ActionFailure` or `TimedOut`.
    ///
    /// Otherwise task failures are recorded in the returned report.
    /// Use [`execute`](Self::execute) to keep the report of an aborted run.
    pub async fn run_many(&self, ids: &[TaskId]) -> Result<RunReport> {
        let report = self.execute(ids).await?;
        if self.options.fail_fast {
            if let Some((id, failure)) = report.first_failure() {
                return Err(Error::from_failure(id.clone(), failure.clone()));
            }
        }
        Ok(report)
    }

    /// Like [`run_many`](Self::run_many), but a `fail_fast` abort still
    /// yields the full report, skipped tasks included. Only resolution
    /// errors are returned as `Err`.
    pub async fn execute(&self, ids: &[TaskId]) -> Result<RunReport> {
        let plan = self.plan(ids)?;
        let mut ctx = RunContext::new(ids.to_vec(), self.vars.fork());
        slog!(
            "run={} requested={:?} planned={}",
            ctx.id.short(),
            ids.iter().map(TaskId::as_str).collect::<Vec<_>>(),
            plan.len()
        );

        let scheduler = Scheduler::new(
            TaskRunner::new(self.options.default_timeout),
            self.options.clone(),
        )
        .with_events(self.event_tx.clone());
        let report = scheduler.execute(&plan, &mut ctx).await;

        if self.options.fail_fast {
            if let Some((id, _)) = report.first_failure() {
                slog_warn!("run={} aborted by {}", ctx.id.short(), id);
            }
        }
        Ok(report)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tasks", &self.registry.len())
            .field("options", &self.options)
            .field("vars", &self.vars.snapshot())
            .finish()
    }
}
