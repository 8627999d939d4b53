//! Deduplicating queue of deferred task invocations.
//!
//! [`DedupQueue`] is the value type; the free functions operate on the queue
//! of the current execution context (see [`crate::context`]).

use std::fmt;

use tracing::debug;

use crate::{
    context,
    task::{Args, Kwargs, Options, Task},
};

/// One deferred invocation: the task plus everything it was called with.
///
/// Equality covers all four fields and is the deduplication key.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub task: Task,
    pub args: Args,
    pub kwargs: Kwargs,
    pub options: Options,
}

impl QueueEntry {
    pub fn new(task: Task, args: Args, kwargs: Kwargs, options: Options) -> Self {
        Self {
            task,
            args,
            kwargs,
            options,
        }
    }
}

impl fmt::Display for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(args={}, kwargs={})",
            self.task.name(),
            serde_json::Value::Array(self.args.clone()),
            serde_json::Value::Object(self.kwargs.clone()),
        )?;
        if self.options != Options::default() {
            write!(f, " {:?}", self.options)?;
        }
        Ok(())
    }
}

/// Insertion-ordered list of [`QueueEntry`] values with no two equal entries.
///
/// Lookups are linear; a request rarely queues more than a handful of tasks,
/// and `serde_json::Value` is not hashable.
#[derive(Debug, Default)]
pub struct DedupQueue {
    entries: Vec<QueueEntry>,
}

impl DedupQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends `entry` unless an equal entry is already queued.
    ///
    /// Returns `true` if the entry was added.
    pub fn push(&mut self, entry: QueueEntry) -> bool {
        if self.entries.contains(&entry) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Removes and returns every entry in insertion order.
    pub fn take_all(&mut self) -> Vec<QueueEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Drops every entry, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn contains(&self, entry: &QueueEntry) -> bool {
        self.entries.contains(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }
}

/// Appends `entry` to the current context's queue unless it is a duplicate.
///
/// Returns `true` if the entry was added.
pub fn append(entry: QueueEntry) -> bool {
    context::with_state(|state| {
        let id = state.id();
        if state.queue().contains(&entry) {
            debug!(context = %id, task = %entry, "removed duplicate task");
            false
        } else {
            debug!(context = %id, task = %entry, "task queued until request finishes");
            state.queue_mut().push(entry)
        }
    })
}

/// Empties the current context's queue and returns its entries in order.
pub fn drain() -> Vec<QueueEntry> {
    context::with_queue(DedupQueue::take_all)
}

/// Empties the current context's queue without dispatching anything.
///
/// Returns the number of entries dropped.
pub fn discard() -> usize {
    context::with_queue(DedupQueue::clear)
}

/// Number of entries queued in the current context.
pub fn len() -> usize {
    context::with_queue(|queue| queue.len())
}

pub fn is_empty() -> bool {
    len() == 0
}

/// Clones the current context's queue.
pub fn snapshot() -> Vec<QueueEntry> {
    context::with_queue(|queue| queue.iter().cloned().collect())
}
