//! Waitable handle abstraction.
//!
//! A `Waitable` is anything the manager can block on and, once ready,
//! hand to a worker thread. Two kinds exist:
//!
//! - **Listening** endpoints (service ports) accept new connections and
//!   hand the resulting session to the manager through a [`WaitableSink`].
//! - **Session** endpoints serve one connected peer.
//!
//! # Contract
//!
//! - `handle()` must stay the same fd for the waitable's whole life.
//! - `handle_signaled()` is never called concurrently for one waitable.
//!   The manager removes it from the waited set before dispatching.
//! - Destruction is `Drop`. The manager drops every waitable exactly once.

use std::fmt;
use std::os::fd::BorrowedFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitableKind {
    Listening,
    Session,
}

/// What the manager does with a waitable after its callback returns.
pub enum HandleOutcome {
    /// Return it to the waited set.
    Continue,
    /// Destroy it.
    Close,
    /// Destroy it and manage the produced waitable in its place.
    Replace(Box<dyn Waitable>),
}

impl fmt::Debug for HandleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "Continue"),
            Self::Close => write!(f, "Close"),
            Self::Replace(w) => write!(f, "Replace({})", w.describe()),
        }
    }
}

/// Somewhere new waitables can be handed off to.
///
/// Implemented by the manager. `add` may be called from any thread,
/// including from inside `handle_signaled` on a worker.
pub trait WaitableSink: Send + Sync {
    fn add(&self, waitable: Box<dyn Waitable>);
}

pub trait Waitable: Send {
    fn kind(&self) -> WaitableKind;

    /// The fd polled for readability (or hangup).
    fn handle(&self) -> BorrowedFd<'_>;

    /// Service one readiness event.
    fn handle_signaled(&mut self, sink: &dyn WaitableSink) -> HandleOutcome;

    /// Short human-readable label for logs.
    fn describe(&self) -> String {
        match self.kind() {
            WaitableKind::Listening => "listener".to_string(),
            WaitableKind::Session => "session".to_string(),
        }
    }
}
