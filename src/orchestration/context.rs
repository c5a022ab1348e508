//! Per-invocation state.

use crate::core::{ActionContext, Task, TaskId, TaskStatus, Vars};
use crate::orchestration::report::Failure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier for one orchestrator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Knobs for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Maximum number of actions in flight at once.
    pub max_parallel: usize,
    /// Default policy for sequential chains whose task sets none.
    pub continue_on_error: bool,
    /// Stop starting new tasks after the first failure and surface it as an error.
    pub fail_fast: bool,
    /// Timeout for tasks that do not set their own.
    pub default_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            continue_on_error: false,
            fail_fast: false,
            default_timeout: None,
        }
    }
}

/// Mutable state of one invocation.
///
/// Created fresh for every call; nothing carries over between runs.
#[derive(Debug)]
pub struct RunContext {
    pub id: RunId,
    /// Task ids the caller asked for.
    pub requested: Vec<TaskId>,
    pub started_at: DateTime<Utc>,
    statuses: HashMap<TaskId, TaskStatus>,
    failures: HashMap<TaskId, Failure>,
    vars: Vars,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(requested: Vec<TaskId>, vars: Vars) -> Self {
        Self {
            id: RunId::new(),
            requested,
            started_at: Utc::now(),
            statuses: HashMap::new(),
            failures: HashMap::new(),
            vars,
            cancel: CancellationToken::new(),
        }
    }

    pub fn status(&self, id: &TaskId) -> TaskStatus {
        self.statuses.get(id).cloned().unwrap_or_default()
    }

    pub fn failure(&self, id: &TaskId) -> Option<&Failure> {
        self.failures.get(id)
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    /// Token cancelled when the run is abandoned. Each action gets a child.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn mark_running(&mut self, id: &TaskId) {
        self.statuses.insert(id.clone(), TaskStatus::Running);
    }

    pub fn mark_succeeded(&mut self, id: &TaskId) {
        self.statuses.insert(id.clone(), TaskStatus::Succeeded);
    }

    pub fn mark_failed(&mut self, id: &TaskId, failure: Failure) {
        self.statuses.insert(
            id.clone(),
            TaskStatus::Failed {
                error: failure.to_string(),
            },
        );
        self.failures.insert(id.clone(), failure);
    }

    pub fn mark_skipped(&mut self, id: &TaskId, blocked_by: TaskId) {
        self.statuses
            .insert(id.clone(), TaskStatus::Skipped { blocked_by });
    }

    /// Ids currently in flight.
    pub fn in_progress(&self) -> Vec<&TaskId> {
        self.statuses
            .iter()
            .filter(|(_, status)| matches!(status, TaskStatus::Running))
            .map(|(id, _)| id)
            .collect()
    }

    /// Number of tasks that reached a terminal state.
    pub fn settled_count(&self) -> usize {
        self.statuses.values().filter(|s| s.is_settled()).count()
    }

    /// Context handed to `task`'s action.
    pub fn action_context(&self, task: &Task) -> ActionContext {
        ActionContext::new(task.id.clone(), self.cancel.child_token(), self.vars.clone())
    }
}
