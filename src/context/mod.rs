//! Execution contexts: the per-request home of the deferred queue and gate.
//!
//! An execution context is the logical unit of concurrent work that owns one
//! [`DedupQueue`] and one queuing flag. Two kinds exist:
//!
//! - **Task-scoped**: a future run through [`scope`] (or a closure run
//!   through [`sync_scope`]) gets a fresh context stored in a Tokio
//!   task-local. This is what [`RequestScope`](crate::lifecycle::RequestScope)
//!   uses for every request.
//! - **Thread-scoped**: synchronous code running outside any scope and
//!   outside any Tokio task falls back to a context stored in a thread-local,
//!   created lazily on first access.
//!
//! A Tokio task that never entered a scope gets neither: many tasks share a
//! runtime worker thread and may migrate between threads, so a thread-local
//! would leak one task's queue into another. Such code sees a *detached*
//! context instead: always idle, and anything written to it is thrown away.
//! Submissions made there are dispatched immediately.
//!
//! State is owned by exactly one context and never shared, so it lives in a
//! `RefCell` rather than behind a lock.

use std::{
    cell::RefCell,
    fmt,
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::queue::DedupQueue;

tokio::task_local! {
    static TASK_STATE: RefCell<ContextState>;
}

thread_local! {
    static THREAD_STATE: RefCell<ContextState> = RefCell::new(ContextState::new());
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Id shared by every detached context.
pub const DETACHED_ID: ContextId = ContextId(0);

/// Process-unique identity of an execution context.
///
/// Only used for diagnostics; lookups never go through the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// The private state of one execution context.
#[derive(Debug)]
pub struct ContextState {
    id: ContextId,
    queuing: bool,
    queue: DedupQueue,
}

impl Default for ContextState {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextState {
    /// Creates an idle context: gate closed, queue empty.
    pub fn new() -> Self {
        Self {
            id: ContextId::next(),
            queuing: false,
            queue: DedupQueue::new(),
        }
    }

    fn detached() -> Self {
        Self {
            id: DETACHED_ID,
            queuing: false,
            queue: DedupQueue::new(),
        }
    }

    /// Identity of the context owning this state.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The gate flag: `true` while submissions are being captured.
    pub fn is_queuing(&self) -> bool {
        self.queuing
    }

    /// Opens or closes the gate. Prefer the [`gate`](crate::gate) functions.
    pub fn set_queuing(&mut self, enabled: bool) {
        self.queuing = enabled;
    }

    /// Submissions captured while the gate was open, in submission order.
    pub fn queue(&self) -> &DedupQueue {
        &self.queue
    }

    /// Mutable access to the captured submissions.
    pub fn queue_mut(&mut self) -> &mut DedupQueue {
        &mut self.queue
    }
}

/// Runs `f` with mutable access to the current context's state.
///
/// Resolves to the enclosing task scope if there is one. Otherwise, inside an
/// unscoped Tokio task, `f` gets a fresh detached state that is dropped when
/// it returns; outside Tokio it gets the calling thread's context. `f` must
/// not re-enter this module: the state is borrowed for the duration of the
/// call.
pub fn with_state<R>(f: impl FnOnce(&mut ContextState) -> R) -> R {
    if is_task_scoped() {
        TASK_STATE.with(|cell| f(&mut cell.borrow_mut()))
    } else if is_detached() {
        f(&mut ContextState::detached())
    } else {
        THREAD_STATE.with(|cell| f(&mut cell.borrow_mut()))
    }
}

/// Runs `f` with mutable access to the current context's queue, creating an
/// empty queue on first access.
pub fn with_queue<R>(f: impl FnOnce(&mut DedupQueue) -> R) -> R {
    with_state(|state| f(state.queue_mut()))
}

/// Returns the id of the current context.
pub fn current_id() -> ContextId {
    with_state(|state| state.id())
}

/// Returns `true` when running inside [`scope`] or [`sync_scope`].
pub fn is_task_scoped() -> bool {
    TASK_STATE.try_with(|_| ()).is_ok()
}

/// Returns `true` inside a Tokio task that has not entered [`scope`].
///
/// State changes made here do not persist; see the module docs.
pub fn is_detached() -> bool {
    !is_task_scoped() && tokio::task::try_id().is_some()
}

/// Runs `future` inside a fresh execution context.
///
/// The context is dropped, together with anything still queued in it, when
/// the future completes or is dropped. Tasks spawned from inside the future
/// do not inherit it.
pub fn scope<F>(future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    TASK_STATE.scope(RefCell::new(ContextState::new()), future)
}

/// Synchronous counterpart of [`scope`].
pub fn sync_scope<R>(f: impl FnOnce() -> R) -> R {
    TASK_STATE.sync_scope(RefCell::new(ContextState::new()), f)
}

/// Replaces the current context's state with a fresh one.
///
/// Intended for test setup and teardown.
pub fn reset() {
    with_state(|state| *state = ContextState::new());
}
