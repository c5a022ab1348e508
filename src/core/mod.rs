//! Core domain model: tasks, the registry that names them, and the resolver
//! that turns a request into an ordered execution plan.

pub mod action;
pub mod dag;
pub mod registry;
pub mod task;

pub use action::{from_async, from_fn, Action, ActionContext, ActionError, ActionResult, Vars};
pub use dag::{DependencyResolver, EdgeKind, ExecutionPlan};
pub use registry::TaskRegistry;
pub use task::{Composition, ErrorPolicy, Task, TaskId, TaskStatus};
