//! Queuing gate: decides whether submissions are captured or dispatched.
//!
//! The flag belongs to the current execution context and defaults to closed,
//! so code running outside a request dispatches tasks immediately.

use tracing::trace;

use crate::context;

/// Starts capturing task submissions in the current context. Idempotent.
pub fn enable_queuing() {
    context::with_state(|state| {
        trace!(context = %state.id(), "task queuing enabled");
        state.set_queuing(true);
    });
}

/// Stops capturing task submissions in the current context.
///
/// Idempotent, and safe to call without a prior [`enable_queuing`].
pub fn disable_queuing() {
    context::with_state(|state| {
        trace!(context = %state.id(), "task queuing disabled");
        state.set_queuing(false);
    });
}

/// Returns whether submissions in the current context are being queued.
pub fn is_queuing_enabled() -> bool {
    context::with_state(|state| state.is_queuing())
}
