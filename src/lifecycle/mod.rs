//! Request lifecycle bridge: opens, flushes and discards the deferred queue.
//!
//! Each execution context moves through two states:
//!
//! ```text
//!            request_started
//!   IDLE ─────────────────────▶ QUEUING
//!     ▲                            │
//!     └────────────────────────────┘
//!      request_finished (flush) / request_failed (discard)
//! ```
//!
//! The three handlers can be called directly, wired to a [`Signals`]
//! registry with [`install`], or driven by [`RequestScope`] around a request
//! future.

pub mod middleware;
pub mod signals;

use tracing::{debug, warn};

use crate::{background::DispatchError, context, gate, queue};

pub use middleware::{Outcome, RequestScope, ScopeError};
pub use signals::{Signal, Signals};

/// Receiver uid for the request-started handler.
pub const STARTED_UID: &str = "request_started_tasks";
/// Receiver uid for the request-finished handler.
pub const FINISHED_UID: &str = "request_finished_tasks";
/// Receiver uid for the request-failed handler.
pub const FAILED_UID: &str = "request_exception_tasks";

/// Starts queuing task submissions in the current context.
///
/// Inside a Tokio task this needs an enclosing [`context::scope`] (which
/// [`RequestScope`] provides). Without one the call is ignored with a
/// warning and submissions keep dispatching immediately.
pub fn request_started() {
    if context::is_detached() {
        warn!(
            "request started in a Tokio task without an execution context: \
             wrap the request in RequestScope or context::scope to defer tasks"
        );
        return;
    }
    gate::enable_queuing();
    debug!(context = %context::current_id(), "request started: queuing tasks");
}

/// Stops queuing and dispatches everything queued, in submission order.
///
/// The gate is closed and the queue drained before the first dispatch, so a
/// task submitted while flushing goes straight to its executor.
///
/// # Returns
///
/// The number of tasks dispatched.
///
/// # Errors
///
/// Returns the first [`DispatchError`]. Tasks drained after the failing one
/// are dropped; the context is left idle with an empty queue either way.
pub fn request_finished() -> Result<usize, DispatchError> {
    gate::disable_queuing();
    let entries = queue::drain();
    let total = entries.len();
    debug!(context = %context::current_id(), tasks = total, "request finished: sending tasks");

    for (sent, entry) in entries.into_iter().enumerate() {
        let name = entry.task.name().to_owned();
        if let Err(e) = entry
            .task
            .submit_now(entry.args, entry.kwargs, entry.options)
        {
            warn!(
                task = %name,
                error = %e,
                dropped = total - sent - 1,
                "dispatch failed while flushing deferred tasks"
            );
            return Err(e);
        }
    }

    Ok(total)
}

/// Stops queuing and drops everything queued without dispatching it.
///
/// # Returns
///
/// The number of tasks discarded.
pub fn request_failed() -> usize {
    gate::disable_queuing();
    let dropped = queue::discard();
    if dropped > 0 {
        debug!(context = %context::current_id(), tasks = dropped, "request failed: discarded tasks");
    }
    dropped
}

/// Connects the three lifecycle handlers to `signals`.
///
/// Uses fixed receiver uids, so installing twice is harmless.
pub fn install(signals: &Signals) {
    signals.connect(Signal::Started, STARTED_UID, || {
        request_started();
        Ok(())
    });
    signals.connect(Signal::Finished, FINISHED_UID, || request_finished().map(drop));
    signals.connect(Signal::Failed, FAILED_UID, || {
        request_failed();
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use serde_json::json;

    use super::*;
    use crate::{
        args,
        background::{InlineExecutor, JobError},
        kwargs,
        task::{Options, task},
        testing::RecordingExecutor,
    };

    #[test]
    fn started_enables_queuing() {
        assert!(!gate::is_queuing_enabled());
        request_started();
        assert!(gate::is_queuing_enabled());
        request_failed();
        assert!(!gate::is_queuing_enabled());
    }

    #[test]
    fn finished_dispatches_each_queued_task_once() {
        let executor = Arc::new(RecordingExecutor::new());
        let job = task("job_x", executor.clone(), |_, _| Ok(json!(null)));

        request_started();
        job.delay(args![], kwargs! {}).unwrap();
        job.delay(args![], kwargs! {}).unwrap();
        assert_eq!(queue::len(), 1);

        assert_eq!(request_finished(), Ok(1));

        assert!(queue::is_empty());
        assert!(!gate::is_queuing_enabled());
        assert_eq!(executor.names(), vec!["job_x"]);
    }

    #[test]
    fn failed_discards_without_dispatching() {
        let executor = Arc::new(RecordingExecutor::new());
        let job = task("job_x", executor.clone(), |_, _| Ok(json!(null)));

        request_started();
        job.delay(args![], kwargs! {}).unwrap();
        assert_eq!(queue::len(), 1);

        assert_eq!(request_failed(), 1);

        assert!(queue::is_empty());
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn failed_is_idempotent_when_idle() {
        assert_eq!(request_failed(), 0);
        assert_eq!(request_failed(), 0);
        assert!(!gate::is_queuing_enabled());
    }

    #[test]
    fn flush_preserves_submission_order_and_options() {
        let executor = Arc::new(RecordingExecutor::new());
        let a = task("a", executor.clone(), |_, _| Ok(json!(null)));
        let b = task("b", executor.clone(), |_, _| Ok(json!(null)));

        request_started();
        b.delay(args![1], kwargs! {}).unwrap();
        a.apply_async(args![], kwargs! {}, Options::new().queue("low")).unwrap();
        b.delay(args![2], kwargs! {}).unwrap();
        request_finished().unwrap();

        let calls = executor.calls();
        assert_eq!(executor.names(), vec!["b", "a", "b"]);
        assert_eq!(calls[1].options.queue.as_deref(), Some("low"));
        assert_eq!(calls[2].args, args![2]);
    }

    #[test]
    fn tasks_submitted_while_flushing_dispatch_immediately() {
        let followups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&followups);
        let followup = task("followup", Arc::new(InlineExecutor), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        });

        let parent = task("parent", Arc::new(InlineExecutor), move |_, _| {
            let dispatched = followup
                .delay(args![], kwargs! {})
                .map_err(JobError::failed)?;
            assert!(dispatched.is_some());
            Ok(json!(null))
        });

        request_started();
        parent.delay(args![], kwargs! {}).unwrap();
        assert_eq!(followups.load(Ordering::SeqCst), 0);

        request_finished().unwrap();

        assert_eq!(followups.load(Ordering::SeqCst), 1);
        assert!(queue::is_empty());
    }

    #[test]
    fn dispatch_failure_mid_flush_leaves_context_idle() {
        let good = Arc::new(RecordingExecutor::new());
        let bad = Arc::new(RecordingExecutor::failing());
        let first = task("first", good.clone(), |_, _| Ok(json!(null)));
        let broken = task("broken", bad, |_, _| Ok(json!(null)));
        let last = task("last", good.clone(), |_, _| Ok(json!(null)));

        request_started();
        first.delay(args![], kwargs! {}).unwrap();
        broken.delay(args![], kwargs! {}).unwrap();
        last.delay(args![], kwargs! {}).unwrap();

        assert!(matches!(request_finished(), Err(DispatchError::Rejected(_))));

        assert!(!gate::is_queuing_enabled());
        assert!(queue::is_empty());
        assert_eq!(good.names(), vec!["first"]);
    }

    #[test]
    fn finished_without_start_dispatches_nothing() {
        assert_eq!(request_finished(), Ok(0));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unscoped_task_cannot_capture_another_tasks_submissions() {
        let executor = Arc::new(RecordingExecutor::new());
        let job = task("job", executor.clone(), |_, _| Ok(json!(null)));

        let request = tokio::spawn(async {
            request_started();
            let queuing = gate::is_queuing_enabled();
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            (queuing, request_failed())
        });
        let background = tokio::spawn(async move {
            tokio::task::yield_now().await;
            job.delay(args!["background"], kwargs! {}).unwrap()
        });

        assert_eq!(request.await.unwrap(), (false, 0));
        assert!(background.await.unwrap().is_some());
        assert_eq!(executor.calls().len(), 1);
        assert_eq!(executor.calls()[0].args, args!["background"]);
    }

    #[tokio::test]
    async fn scoped_task_queues_through_direct_handlers() {
        let executor = Arc::new(RecordingExecutor::new());
        let job = task("job", executor.clone(), |_, _| Ok(json!(null)));

        let dispatched = tokio::spawn(context::scope(async move {
            request_started();
            job.delay(args![], kwargs! {}).unwrap();
            tokio::task::yield_now().await;
            assert_eq!(queue::len(), 1);
            request_finished().unwrap()
        }));

        assert_eq!(dispatched.await.unwrap(), 1);
        assert_eq!(executor.names(), vec!["job"]);
    }

    #[test]
    fn install_wires_handlers_to_signals() {
        let executor = Arc::new(RecordingExecutor::new());
        let job = task("job", executor.clone(), |_, _| Ok(json!(null)));
        let signals = Signals::new();
        install(&signals);
        install(&signals);

        signals.send(Signal::Started).unwrap();
        job.delay(args![], kwargs! {}).unwrap();
        assert!(executor.calls().is_empty());
        signals.send(Signal::Finished).unwrap();
        assert_eq!(executor.calls().len(), 1);

        signals.send(Signal::Started).unwrap();
        job.delay(args![], kwargs! {}).unwrap();
        signals.send(Signal::Failed).unwrap();
        assert_eq!(executor.calls().len(), 1);
        assert!(!gate::is_queuing_enabled());
    }
}
