//! Background execution: the engines that actually run tasks.
//!
//! The deferred queue never runs anything itself; it hands jobs to an
//! [`Executor`]. Two are provided:
//!
//! - [`InlineExecutor`]: runs the job synchronously inside `dispatch`.
//!   Useful in tests and for jobs cheap enough to run in the request's wake.
//! - [`TokioExecutor`]: in-process async task queue backed by a bounded Tokio
//!   channel, with countdowns and retry backoff.
//!
//! Any other engine (a message broker client, a thread pool) plugs in by
//! implementing [`Executor`].

pub mod worker;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use crate::task::{Args, JobFn, Kwargs, Options};

pub use worker::{TokioExecutor, WorkerConfig};

/// Errors returned when an executor refuses a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("executor is shut down")]
    Closed,

    #[error("executor rejected task: {0}")]
    Rejected(String),
}

/// Errors produced by running a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("executor dropped the task before it completed")]
    Abandoned,
}

impl JobError {
    /// Convenience constructor for job functions.
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Everything an executor needs to run one invocation.
pub struct Job {
    pub name: String,
    pub func: JobFn,
    pub args: Args,
    pub kwargs: Kwargs,
    pub options: Options,
}

impl Job {
    /// Runs the job function once on the calling thread.
    pub fn call(&self) -> Result<Value, JobError> {
        (self.func)(&self.args, &self.kwargs)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A task execution engine.
///
/// `dispatch` must not block on the job itself unless the engine is
/// deliberately synchronous; its result reports whether the engine accepted
/// the job, and the returned [`TaskHandle`] reports how the job went.
pub trait Executor: Send + Sync {
    fn dispatch(&self, job: Job) -> Result<TaskHandle, DispatchError>;
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier assigned to each dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

enum HandleState {
    Ready(Result<Value, JobError>),
    Pending(oneshot::Receiver<Result<Value, JobError>>),
}

/// Handle to a dispatched job.
pub struct TaskHandle {
    id: TaskId,
    state: HandleState,
}

impl TaskHandle {
    /// A handle for a job that has already run.
    pub fn ready(result: Result<Value, JobError>) -> Self {
        Self {
            id: TaskId::next(),
            state: HandleState::Ready(result),
        }
    }

    /// A handle whose result arrives on `receiver`.
    pub fn pending(receiver: oneshot::Receiver<Result<Value, JobError>>) -> Self {
        Self {
            id: TaskId::next(),
            state: HandleState::Pending(receiver),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns `true` if the job's result is already available.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }

    /// Waits for the job to finish and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the job's own [`JobError`], or [`JobError::Abandoned`] if the
    /// executor went away without reporting a result.
    pub async fn wait(self) -> Result<Value, JobError> {
        match self.state {
            HandleState::Ready(result) => result,
            HandleState::Pending(receiver) => receiver.await.unwrap_or(Err(JobError::Abandoned)),
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Runs each job to completion inside `dispatch`.
///
/// Options other than the job's arguments are ignored; failures are reported
/// through the handle, never as a [`DispatchError`].
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn dispatch(&self, job: Job) -> Result<TaskHandle, DispatchError> {
        let result = job.call();
        if let Err(error) = &result {
            warn!(task = %job.name, error = %error, "task failed");
        }
        Ok(TaskHandle::ready(result))
    }
}
