//! The contract between the orchestrator and the work a task performs.
//!
//! An action is invoked with an [`ActionContext`] and signals completion
//! through a boxed future. Async closures, blocking closures and concrete
//! action types (see [`crate::actions`]) all look the same to the runner.

use crate::core::task::TaskId;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Error type returned by actions. Any error converts into it with `?`.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Completion signal of an action.
pub type ActionResult = std::result::Result<(), ActionError>;

/// Work performed when a task runs.
pub trait Action: Send + Sync {
    fn call(&self, ctx: ActionContext) -> BoxFuture<'static, ActionResult>;
}

/// Named string values shared by the actions of one run.
///
/// Replaces process-global build state: an action that derives a value
/// (a release version, say) stores it here and later actions read it.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }

    /// Sorted copy of the current values.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Independent copy; writes to the fork are not seen by `self`.
    pub fn fork(&self) -> Self {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner()).clone();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Vars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<HashMap<_, _>>();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }
}

/// Everything an action receives when invoked.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// The task being run.
    pub task: TaskId,
    /// Cancelled when the task times out or the run is abandoned.
    pub cancel: CancellationToken,
    /// Variables of the current run.
    pub vars: Vars,
}

impl ActionContext {
    pub fn new(task: TaskId, cancel: CancellationToken, vars: Vars) -> Self {
        Self { task, cancel, vars }
    }
}

/// Action backed by an async closure.
pub struct AsyncFnAction<F> {
    f: F,
}

impl<F, Fut> Action for AsyncFnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    fn call(&self, ctx: ActionContext) -> BoxFuture<'static, ActionResult> {
        Box::pin((self.f)(ctx))
    }
}

/// Wrap an async closure as an action.
pub fn from_async<F, Fut>(f: F) -> AsyncFnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    AsyncFnAction { f }
}

/// Action backed by a blocking closure, run on the blocking thread pool.
pub struct BlockingFnAction<F> {
    f: Arc<F>,
}

impl<F> Action for BlockingFnAction<F>
where
    F: Fn(ActionContext) -> ActionResult + Send + Sync + 'static,
{
    fn call(&self, ctx: ActionContext) -> BoxFuture<'static, ActionResult> {
        let f = Arc::clone(&self.f);
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || f(ctx)).await {
                Ok(result) => result,
                // Re-raise so the runner reports the panic rather than a join error.
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => Err(Box::new(e) as ActionError),
            }
        })
    }
}

/// Wrap a synchronous closure as an action.
pub fn from_fn<F>(f: F) -> BlockingFnAction<F>
where
    F: Fn(ActionContext) -> ActionResult + Send + Sync + 'static,
{
    BlockingFnAction { f: Arc::new(f) }
}
