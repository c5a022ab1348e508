use thiserror::Error;

use crate::core::TaskId;
use crate::orchestration::Failure;

/// Process exit codes for the `stoke` binary.
pub mod exit_code {
    /// Every requested task succeeded.
    pub const OK: i32 = 0;
    /// At least one task failed or was skipped because a dependency failed.
    pub const TASK_FAILED: i32 = 1;
    /// The requested graph could not be resolved (unknown task, missing dependency, cycle).
    pub const RESOLUTION: i32 = 2;
    /// Configuration, I/O or other setup errors.
    pub const SETUP: i32 = 3;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Task file not found (looked for {name} from {start})")]
    TaskFileNotFound { name: String, start: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Task already registered: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Task {task} failed: {source}")]
    ActionFailure {
        task: TaskId,
        #[source]
        source: Failure,
    },

    #[error("Task {task} timed out after {after:?}")]
    TimedOut {
        task: TaskId,
        after: std::time::Duration,
    },

    #[error("Task {task} skipped: dependency {dependency} failed")]
    SkippedDueToDependencyFailure { task: TaskId, dependency: TaskId },

    #[error("Shell not found: {0}")]
    ShellNotFound(String),

    #[error("Command `{command}` failed ({}){}", format_code(.code), format_stderr(.stderr))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Undefined variable: ${{{0}}}")]
    UndefinedVar(String),

    #[error("No value at {pointer} in {path}")]
    JsonPointerNotFound { path: String, pointer: String },

    #[error("Task {0} cancelled")]
    Cancelled(TaskId),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Map a failure reported by the scheduler onto the error taxonomy.
    pub fn from_failure(task: TaskId, failure: Failure) -> Self {
        match failure {
            Failure::TimedOut(after) => Error::TimedOut { task, after },
            other => Error::ActionFailure {
                task,
                source: other,
            },
        }
    }

    /// Exit code the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UnknownTask(_)
            | Error::UnknownDependency { .. }
            | Error::CyclicDependency { .. } => exit_code::RESOLUTION,
            Error::ActionFailure { .. }
            | Error::TimedOut { .. }
            | Error::SkippedDueToDependencyFailure { .. } => exit_code::TASK_FAILED,
            _ => exit_code::SETUP,
        }
    }
}

fn format_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

fn format_stderr(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
