//! Deferred tasks: the entry point job producers submit work through.
//!
//! A [`Task`] pairs a plain job function with the [`Executor`] that runs it.
//! Calling [`Task::delay`] or [`Task::apply_async`] consults the queuing gate
//! of the current execution context:
//!
//! - **gate closed** (no request in flight): the job goes straight to the
//!   executor and a [`TaskHandle`] is returned;
//! - **gate open**: the invocation is queued (deduplicated) until the request
//!   finishes, and `None` is returned.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use deferq::{args, kwargs, task, background::InlineExecutor, lifecycle};
//!
//! let reindex = task("reindex", Arc::new(InlineExecutor), |args, _kwargs| {
//!     Ok(args[0].clone())
//! });
//!
//! lifecycle::request_started();
//! assert!(reindex.delay(args![7], kwargs! {}).unwrap().is_none());
//! assert!(reindex.delay(args![7], kwargs! {}).unwrap().is_none());
//! assert_eq!(lifecycle::request_finished().unwrap(), 1);
//! ```

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    background::{DispatchError, Executor, Job, JobError, TaskHandle},
    gate,
    queue::{self, QueueEntry},
};

/// Positional task arguments.
pub type Args = Vec<Value>;

/// Named task arguments. Equality ignores key order.
pub type Kwargs = Map<String, Value>;

/// A type-erased job function shared by every invocation of a task.
pub type JobFn = Arc<dyn Fn(&Args, &Kwargs) -> Result<Value, JobError> + Send + Sync + 'static>;

/// Executor-level options for one invocation.
///
/// Options are part of the deduplication key: two submissions that differ only
/// in options are queued separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Higher runs sooner, where the executor supports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Extra attempts after a failed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Delay before the first attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown: Option<Duration>,
    /// Named executor queue to route to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Executor-specific options with no dedicated field.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    #[must_use]
    pub fn countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

struct TaskInner {
    name: String,
    func: JobFn,
    executor: Arc<dyn Executor>,
}

/// A registered background task.
///
/// Cheap to clone. Two tasks are equal when their names are equal, so the
/// name is the task's identity in the deduplication key.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

/// Registers `func` as a task named `name`, run by `executor`.
///
/// Shorthand for [`Task::new`].
pub fn task<F>(name: impl Into<String>, executor: Arc<dyn Executor>, func: F) -> Task
where
    F: Fn(&Args, &Kwargs) -> Result<Value, JobError> + Send + Sync + 'static,
{
    Task::new(name, executor, func)
}

impl Task {
    pub fn new<F>(name: impl Into<String>, executor: Arc<dyn Executor>, func: F) -> Self
    where
        F: Fn(&Args, &Kwargs) -> Result<Value, JobError> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(TaskInner {
                name: name.into(),
                func: Arc::new(func),
                executor,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Submits the task with default options.
    ///
    /// See [`apply_async`](Self::apply_async).
    pub fn delay(&self, args: Args, kwargs: Kwargs) -> Result<Option<TaskHandle>, DispatchError> {
        self.apply_async(args, kwargs, Options::default())
    }

    /// Submits the task, deferring it if a request is in flight.
    ///
    /// # Returns
    ///
    /// - `Ok(None)` when the invocation was queued (or was a duplicate of one
    ///   already queued) and will be dispatched when the request finishes.
    /// - `Ok(Some(handle))` when it was dispatched immediately.
    ///
    /// # Errors
    ///
    /// Returns the executor's [`DispatchError`] when dispatching immediately
    /// fails. Queued submissions never fail.
    pub fn apply_async(
        &self,
        args: Args,
        kwargs: Kwargs,
        options: Options,
    ) -> Result<Option<TaskHandle>, DispatchError> {
        if gate::is_queuing_enabled() {
            queue::append(QueueEntry::new(self.clone(), args, kwargs, options));
            return Ok(None);
        }
        self.submit_now(args, kwargs, options).map(Some)
    }

    /// Hands the task to the executor right away, whatever the gate says.
    ///
    /// # Errors
    ///
    /// Propagates the executor's [`DispatchError`] unchanged.
    pub fn submit_now(
        &self,
        args: Args,
        kwargs: Kwargs,
        options: Options,
    ) -> Result<TaskHandle, DispatchError> {
        debug!(task = %self.name(), "dispatching task");
        self.inner.executor.dispatch(Job {
            name: self.inner.name.clone(),
            func: Arc::clone(&self.inner.func),
            args,
            kwargs,
            options,
        })
    }

    /// Runs the job function in the caller, bypassing gate and executor.
    pub fn run(&self, args: &Args, kwargs: &Kwargs) -> Result<Value, JobError> {
        (self.inner.func)(args, kwargs)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name
    }
}

impl Eq for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("name", &self.inner.name).finish()
    }
}

/// Builds an [`Args`] vector from JSON-convertible expressions.
///
/// ```rust
/// let args: deferq::task::Args = deferq::args![42, "x"];
/// assert_eq!(args.len(), 2);
/// ```
#[macro_export]
macro_rules! args {
    ($($value:expr),* $(,)?) => {{
        let args: $crate::task::Args = ::std::vec![$($crate::__private::json!($value)),*];
        args
    }};
}

/// Builds a [`Kwargs`] map from `key => value` pairs.
///
/// ```rust
/// let kwargs = deferq::kwargs! {"bar" => "a", "n" => 3};
/// assert_eq!(kwargs["n"], 3);
/// ```
#[macro_export]
macro_rules! kwargs {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut kwargs = $crate::task::Kwargs::new();
        $(
            kwargs.insert(::std::string::String::from($key), $crate::__private::json!($value));
        )*
        kwargs
    }};
}
