//! Observer registry for request lifecycle notifications.
//!
//! The host's request-handling layer calls [`Signals::send`] at the start of a
//! request, after it completes, and after an unhandled failure. Receivers are
//! registered under a uid so that repeated registration (e.g. a module
//! initialised twice) connects them only once.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use tracing::trace;

use crate::background::DispatchError;

/// A request lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Before the request handler runs.
    Started,
    /// After the handler completed successfully.
    Finished,
    /// After the handler failed.
    Failed,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "request_started",
            Self::Finished => "request_finished",
            Self::Failed => "request_failed",
        })
    }
}

/// A type-erased, reference-counted signal receiver.
pub type Receiver = Arc<dyn Fn() -> Result<(), DispatchError> + Send + Sync + 'static>;

struct Connection {
    signal: Signal,
    uid: String,
    receiver: Receiver,
}

/// Registry of receivers for each [`Signal`].
///
/// # Examples
///
/// ```rust
/// use deferq::lifecycle::{self, Signal, Signals};
///
/// let signals = Signals::new();
/// lifecycle::install(&signals);
///
/// signals.send(Signal::Started).unwrap();
/// assert!(deferq::gate::is_queuing_enabled());
/// signals.send(Signal::Failed).unwrap();
/// assert!(!deferq::gate::is_queuing_enabled());
/// ```
#[derive(Default)]
pub struct Signals {
    connections: RwLock<Vec<Connection>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `receiver` to `signal` under `uid`.
    ///
    /// Returns `false` and leaves the registry unchanged if a receiver with
    /// the same `signal` and `uid` is already connected.
    pub fn connect<F>(&self, signal: Signal, uid: impl Into<String>, receiver: F) -> bool
    where
        F: Fn() -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        let uid = uid.into();
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if connections
            .iter()
            .any(|c| c.signal == signal && c.uid == uid)
        {
            trace!(%signal, %uid, "receiver already connected");
            return false;
        }

        trace!(%signal, %uid, "receiver connected");
        connections.push(Connection {
            signal,
            uid,
            receiver: Arc::new(receiver),
        });
        true
    }

    /// Removes the receiver connected to `signal` under `uid`.
    ///
    /// Returns `true` if one was removed.
    pub fn disconnect(&self, signal: Signal, uid: &str) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = connections.len();
        connections.retain(|c| !(c.signal == signal && c.uid == uid));
        connections.len() != before
    }

    /// Number of receivers connected to `signal`.
    pub fn receiver_count(&self, signal: Signal) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.signal == signal)
            .count()
    }

    /// Invokes every receiver connected to `signal`, in connection order.
    ///
    /// Receivers run after the registry lock is released, so they may connect
    /// or disconnect receivers themselves.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first receiver error.
    pub fn send(&self, signal: Signal) -> Result<(), DispatchError> {
        let receivers: Vec<Receiver> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.signal == signal)
            .map(|c| Arc::clone(&c.receiver))
            .collect();

        trace!(%signal, receivers = receivers.len(), "sending signal");
        for receiver in receivers {
            receiver()?;
        }
        Ok(())
    }
}

impl fmt::Debug for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_list()
            .entries(connections.iter().map(|c| (c.signal, &c.uid)))
            .finish()
    }
}
