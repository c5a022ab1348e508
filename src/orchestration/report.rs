//! Outcomes of individual tasks and the aggregate report of a run.

use crate::core::TaskId;
use crate::error::{exit_code, Error, Result};
use crate::orchestration::context::RunId;
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;

/// Why a task did not succeed.
#[derive(Debug, Clone)]
pub enum Failure {
    /// The action returned an error. The original error is kept as source.
    Action(Arc<dyn std::error::Error + Send + Sync>),
    /// The action panicked.
    Panicked(String),
    /// The action did not settle within its timeout.
    TimedOut(Duration),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Action(err) => write!(f, "{}", err),
            Failure::Panicked(msg) => write!(f, "action panicked: {}", msg),
            Failure::TimedOut(after) => write!(f, "timed out after {:?}", after),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Failure::Action(err) => {
                let source: &(dyn std::error::Error + 'static) = err.as_ref();
                Some(source)
            }
            _ => None,
        }
    }
}

impl Serialize for Failure {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Final state of one task in a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TaskOutcome {
    Succeeded,
    Failed { reason: Failure },
    /// Never invoked: `blocked_by` failed upstream.
    Skipped { blocked_by: TaskId },
}

impl TaskOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TaskOutcome::Skipped { .. })
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Succeeded => write!(f, "succeeded"),
            TaskOutcome::Failed { reason } => write!(f, "failed: {}", reason),
            TaskOutcome::Skipped { blocked_by } => {
                write!(f, "skipped: dependency {} failed", blocked_by)
            }
        }
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// What the runner reports for one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl TaskReport {
    pub fn new(id: TaskId, outcome: TaskOutcome, elapsed: Duration) -> Self {
        Self {
            id,
            outcome,
            elapsed,
        }
    }

    pub fn skipped(id: TaskId, blocked_by: TaskId) -> Self {
        Self::new(id, TaskOutcome::Skipped { blocked_by }, Duration::ZERO)
    }
}

/// Aggregate outcome of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub requested: Vec<TaskId>,
    /// Every planned task, in execution order.
    pub tasks: Vec<TaskReport>,
    /// The task that failed first, in completion order.
    pub first_failure: Option<TaskId>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl RunReport {
    pub fn get(&self, id: &TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn outcome(&self, id: &str) -> Option<&TaskOutcome> {
        self.tasks
            .iter()
            .find(|t| t.id.as_str() == id)
            .map(|t| &t.outcome)
    }

    /// Number of tasks whose action was actually invoked.
    pub fn run_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.outcome.is_skipped()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.tasks.iter().filter(|t| t.outcome.is_succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.tasks.iter().filter(|t| t.outcome.is_failed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.tasks.iter().filter(|t| t.outcome.is_skipped()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.outcome.is_failed())
    }

    pub fn skips(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.outcome.is_skipped())
    }

    /// The first failure with its reason.
    pub fn first_failure(&self) -> Option<(&TaskId, &Failure)> {
        let id = self.first_failure.as_ref()?;
        match &self.get(id)?.outcome {
            TaskOutcome::Failed { reason } => Some((id, reason)),
            _ => None,
        }
    }

    /// True if every planned task succeeded.
    pub fn is_success(&self) -> bool {
        self.tasks.iter().all(|t| t.outcome.is_succeeded())
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            exit_code::OK
        } else {
            exit_code::TASK_FAILED
        }
    }

    /// Surface the first failure as an error.
    pub fn into_result(self) -> Result<RunReport> {
        if let Some((id, failure)) = self.first_failure() {
            return Err(Error::from_failure(id.clone(), failure.clone()));
        }
        if let Some(skip) = self.skips().next() {
            if let TaskOutcome::Skipped { blocked_by } = &skip.outcome {
                return Err(Error::SkippedDueToDependencyFailure {
                    task: skip.id.clone(),
                    dependency: blocked_by.clone(),
                });
            }
        }
        Ok(self)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let width = self
            .tasks
            .iter()
            .map(|t| t.id.as_str().len())
            .max()
            .unwrap_or(0);
        for task in &self.tasks {
            match &task.outcome {
                TaskOutcome::Skipped { .. } => {
                    writeln!(f, "  {:<width$}  {}", task.id.as_str(), task.outcome)?
                }
                outcome => writeln!(
                    f,
                    "  {:<width$}  {} ({} ms)",
                    task.id.as_str(),
                    outcome,
                    task.elapsed.as_millis()
                )?,
            }
        }
        write!(
            f,
            "{} tasks: {} succeeded, {} failed, {} skipped in {} ms",
            self.tasks.len(),
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.elapsed.as_millis()
        )
    }
}
