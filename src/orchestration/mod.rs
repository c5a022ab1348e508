//! Execution layer.
//!
//! This module turns resolved plans into runs: the runner invokes single
//! actions, the scheduler drives a plan with bounded parallelism, the
//! orchestrator is the entry point callers use, and the watch controller
//! re-enters the orchestrator when files change.

mod context;
mod orchestrator;
mod report;
mod runner;
mod scheduler;
mod watch;

pub use context::{RunContext, RunId, RunOptions};
pub use orchestrator::Orchestrator;
pub use report::{Failure, RunReport, TaskOutcome, TaskReport};
pub use runner::TaskRunner;
pub use scheduler::{Scheduler, SchedulerEvent};
pub use watch::{
    WatchBinding, WatchController, WatchEvent, WatchHandle, WatchState, WatchSummary,
    DEFAULT_DEBOUNCE_MS,
};
