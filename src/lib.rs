pub mod actions;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use config::TaskFile;
pub use core::{Task, TaskId, TaskRegistry};
pub use error::{Error, Result};
pub use orchestration::{Orchestrator, RunOptions, RunReport};
