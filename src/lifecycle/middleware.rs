//! Request-scoped middleware hook for the deferred task queue.
//!
//! [`RequestScope`] wraps the handling of a single request:
//!
//! 1. open a fresh execution context for the request future;
//! 2. send [`Signal::Started`];
//! 3. await the request and classify its output with [`Outcome`];
//! 4. send [`Signal::Finished`] on success, [`Signal::Failed`] otherwise.
//!
//! If the request future panics or is dropped mid-flight, the context (and
//! every task queued in it) is dropped without being dispatched.

use std::{error::Error as StdError, fmt, future::Future, pin::Pin, sync::Arc};

use tracing::debug;

use crate::{
    background::DispatchError,
    context,
    lifecycle::{self, Signal, Signals},
};

/// Classifies the output of a request as success or failure.
pub trait Outcome {
    fn is_success(&self) -> bool;
}

impl<T, E> Outcome for Result<T, E> {
    fn is_success(&self) -> bool {
        self.is_ok()
    }
}

impl<T> Outcome for Option<T> {
    fn is_success(&self) -> bool {
        self.is_some()
    }
}

/// A lifecycle signal failed while a request was being scoped.
///
/// Carries the request's output when the request had already run, so a
/// failed flush never swallows the response.
#[derive(Debug)]
pub struct ScopeError<O> {
    signal: Signal,
    source: DispatchError,
    output: Option<O>,
}

impl<O> ScopeError<O> {
    /// The signal whose receivers failed.
    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn dispatch_error(&self) -> &DispatchError {
        &self.source
    }

    /// The request's output, or `None` if `Started` failed and the request
    /// never ran.
    pub fn into_output(self) -> Option<O> {
        self.output
    }
}

impl<O> fmt::Display for ScopeError<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} receivers failed: {}", self.signal, self.source)
    }
}

impl<O: fmt::Debug> StdError for ScopeError<O> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}

/// A boxed, `Send` future produced by a scoped handler.
pub type ScopedFuture<O> = Pin<Box<dyn Future<Output = Result<O, ScopeError<O>>> + Send>>;

/// A type-erased handler whose every invocation runs inside a [`RequestScope`].
pub type ScopedHandler<Req, O> = Arc<dyn Fn(Req) -> ScopedFuture<O> + Send + Sync>;

/// Runs requests inside their own execution context and drives the deferred
/// task lifecycle around them.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use deferq::{args, kwargs, task, background::InlineExecutor, lifecycle::RequestScope};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let notify = task("notify", Arc::new(InlineExecutor), |_, _| Ok(serde_json::json!(null)));
/// let scope = RequestScope::new();
///
/// let response = scope
///     .run(async {
///         notify.delay(args![1], kwargs! {}).unwrap();
///         notify.delay(args![1], kwargs! {}).unwrap();
///         Ok::<_, String>("done")
///     })
///     .await
///     .unwrap();
///
/// assert_eq!(response, Ok("done"));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct RequestScope {
    signals: Arc<Signals>,
}

impl Default for RequestScope {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestScope {
    /// Creates a scope with its own [`Signals`] registry, with the deferred
    /// task handlers installed.
    pub fn new() -> Self {
        let signals = Signals::new();
        lifecycle::install(&signals);
        Self {
            signals: Arc::new(signals),
        }
    }

    /// Creates a scope that sends to an existing registry.
    ///
    /// Nothing is installed; call [`lifecycle::install`] on `signals` if the
    /// deferred task handlers should run.
    pub fn with_signals(signals: Arc<Signals>) -> Self {
        Self { signals }
    }

    pub fn signals(&self) -> &Arc<Signals> {
        &self.signals
    }

    /// Runs `request` inside a fresh execution context.
    ///
    /// # Errors
    ///
    /// Returns a [`ScopeError`] if a lifecycle receiver fails, e.g. when an
    /// executor refuses a task during the flush. The request's output, if it
    /// ran, is available through [`ScopeError::into_output`].
    pub async fn run<F>(&self, request: F) -> Result<F::Output, ScopeError<F::Output>>
    where
        F: Future,
        F::Output: Outcome,
    {
        let signals = Arc::clone(&self.signals);

        context::scope(async move {
            if let Err(source) = signals.send(Signal::Started) {
                return Err(ScopeError {
                    signal: Signal::Started,
                    source,
                    output: None,
                });
            }

            let output = request.await;
            let signal = if output.is_success() {
                Signal::Finished
            } else {
                Signal::Failed
            };
            debug!(context = %context::current_id(), %signal, "request completed");

            match signals.send(signal) {
                Ok(()) => Ok(output),
                Err(source) => Err(ScopeError {
                    signal,
                    source,
                    output: Some(output),
                }),
            }
        })
        .await
    }

    /// Wraps `handler` so every call runs through [`run`](Self::run).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use deferq::lifecycle::RequestScope;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let handler = RequestScope::new().wrap(|id: u32| async move {
    ///     if id == 0 { Err("missing") } else { Ok(id) }
    /// });
    ///
    /// assert_eq!(handler(7).await.unwrap(), Ok(7));
    /// assert_eq!(handler(0).await.unwrap(), Err("missing"));
    /// # }
    /// ```
    pub fn wrap<H, Req, F>(&self, handler: H) -> ScopedHandler<Req, F::Output>
    where
        H: Fn(Req) -> F + Send + Sync + 'static,
        Req: 'static,
        F: Future + Send + 'static,
        F::Output: Outcome + Send + 'static,
    {
        let scope = self.clone();
        Arc::new(move |request: Req| -> ScopedFuture<F::Output> {
            let scope = scope.clone();
            let future = handler(request);
            Box::pin(async move { scope.run(future).await })
        })
    }
}
