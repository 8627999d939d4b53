//! Test doubles shared by the unit tests.

use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use crate::{
    background::{DispatchError, Executor, Job, TaskHandle},
    task::{Args, Kwargs, Options},
};

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub name: String,
    pub args: Args,
    pub kwargs: Kwargs,
    pub options: Options,
}

/// Records every dispatch without running the job, or refuses every dispatch.
#[derive(Debug, Default)]
pub(crate) struct RecordingExecutor {
    calls: Mutex<Vec<RecordedCall>>,
    refuse: bool,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.name).collect()
    }
}

impl Executor for RecordingExecutor {
    fn dispatch(&self, job: Job) -> Result<TaskHandle, DispatchError> {
        if self.refuse {
            return Err(DispatchError::Rejected(format!("{} refused", job.name)));
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                name: job.name,
                args: job.args,
                kwargs: job.kwargs,
                options: job.options,
            });
        Ok(TaskHandle::ready(Ok(Value::Null)))
    }
}
