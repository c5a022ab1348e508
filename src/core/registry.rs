//! Registry of named tasks.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::slog_debug;
use std::collections::HashMap;

/// Holds every registered task, in declaration order.
///
/// Dependencies are stored by name and are not checked here: a task may
/// depend on one registered later. Missing names surface when a plan is
/// resolved.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task.
    ///
    /// # Errors
    /// `DuplicateTask` if a task with the same id is already registered.
    pub fn register(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        slog_debug!(
            "register task={} deps={:?} mode={}",
            task.id,
            task.dependencies,
            task.mode
        );
        self.order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Look up a task.
    ///
    /// # Errors
    /// `UnknownTask` if no task has this id.
    pub fn get(&self, id: &TaskId) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Tasks in the order they were registered.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
