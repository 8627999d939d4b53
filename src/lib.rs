//! # deferq
//!
//! Per-request deferred background tasks.
//!
//! Request handlers often enqueue the same background job several times while
//! processing one request, and a job dispatched mid-request can observe state
//! the request has not committed yet. `deferq` holds task submissions made
//! during a request in a deduplicating queue, then dispatches them when the
//! request succeeds or drops them when it fails. Outside a request, tasks are
//! dispatched immediately.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use deferq::{args, kwargs, task};
//! use deferq::background::{TokioExecutor, WorkerConfig};
//! use deferq::lifecycle::RequestScope;
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = Arc::new(TokioExecutor::spawn(WorkerConfig::new()));
//!     let reindex = task("reindex", executor, |args, _kwargs| {
//!         println!("reindexing {}", args[0]);
//!         Ok(serde_json::Value::Null)
//!     });
//!
//!     let scope = RequestScope::new();
//!     let _ = scope
//!         .run(async {
//!             // Both calls collapse into one job, sent once the request succeeds.
//!             reindex.delay(args![42], kwargs! {}).unwrap();
//!             reindex.delay(args![42], kwargs! {}).unwrap();
//!             Ok::<_, std::io::Error>(())
//!         })
//!         .await;
//! }
//! ```

pub mod background;
pub mod context;
pub mod gate;
pub mod lifecycle;
pub mod queue;
pub mod task;

#[cfg(test)]
mod testing;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use background::{DispatchError, Executor, JobError, TaskHandle};
pub use lifecycle::{RequestScope, ScopeError, Signal, Signals};
pub use task::{Args, Kwargs, Options, Task, task};

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
