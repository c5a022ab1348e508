//! Task data model.
//!
//! A task is a named unit of work with an ordered list of dependencies, a
//! composition mode for that list, and an optional action. Tasks are immutable
//! once registered; per-run state lives in the run context.

use crate::core::action::Action;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Unique, human-chosen identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::borrow::Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// How a task's dependency list is composed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Composition {
    /// Dependencies run one after another, in declared order.
    #[default]
    Sequential,
    /// Dependencies may run concurrently; all must settle before the task.
    Parallel,
}

impl std::fmt::Display for Composition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Composition::Sequential => write!(f, "sequential"),
            Composition::Parallel => write!(f, "parallel"),
        }
    }
}

/// What a sequential chain does when one of its steps fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Skip the remaining steps of the chain.
    FailFast,
    /// Keep running the remaining steps.
    Continue,
}

/// Lifecycle of a task within one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Not started yet (or never started).
    #[default]
    NotRun,
    /// Action currently in flight.
    Running,
    /// Action completed successfully.
    Succeeded,
    /// Action failed, panicked or timed out.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Never started because a task it waits on failed.
    Skipped {
        /// The failed task that caused the skip.
        blocked_by: TaskId,
    },
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::NotRun => write!(f, "not run"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Skipped { blocked_by } => write!(f, "skipped ({} failed)", blocked_by),
        }
    }
}

/// A registered task.
#[derive(Clone)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Optional one-line description shown by `stoke list`.
    pub description: Option<String>,
    /// Tasks that must settle before this one, in declared order.
    pub dependencies: Vec<TaskId>,
    /// Composition of `dependencies`.
    pub mode: Composition,
    /// Work performed when the task runs. Grouping tasks have none.
    pub action: Option<Arc<dyn Action>>,
    /// Per-task timeout overriding the run default.
    pub timeout: Option<Duration>,
    /// Error policy of the sequential chain formed by `dependencies`.
    pub on_error: Option<ErrorPolicy>,
}

impl Task {
    /// Create a grouping task with no dependencies and no action.
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            description: None,
            dependencies: Vec::new(),
            mode: Composition::default(),
            action: None,
            timeout: None,
            on_error: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: Composition) -> Self {
        self.mode = mode;
        self
    }

    /// Shorthand for `with_mode(Composition::Parallel)`.
    pub fn parallel(self) -> Self {
        self.with_mode(Composition::Parallel)
    }

    pub fn with_action(mut self, action: impl Action + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = Some(policy);
        self
    }

    /// A task with no action only groups its dependencies.
    pub fn is_group(&self) -> bool {
        self.action.is_none()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("mode", &self.mode)
            .field("has_action", &self.action.is_some())
            .field("timeout", &self.timeout)
            .field("on_error", &self.on_error)
            .finish()
    }
}
