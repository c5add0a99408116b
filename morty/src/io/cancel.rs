//! Cooperative cancellation shared between the loop, executors, and signal handling.
//!
//! Wraps a [`CancellationToken`] so cancellation is hierarchical: cancelling a
//! parent cancels every child, never the other way round. Used synchronously;
//! no async runtime is involved.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;

/// A cancellation scope with an optional deadline and the signal that tripped it.
#[derive(Debug, Clone)]
pub struct Cancellation {
    token: CancellationToken,
    deadline: Option<Instant>,
    signal: Arc<AtomicI32>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            signal: Arc::new(AtomicI32::new(0)),
        }
    }

    /// A child scope. It shares the parent's signal slot and deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            signal: Arc::clone(&self.signal),
        }
    }

    /// A child scope that also expires after `timeout`. Deadlines only tighten.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(existing) => existing.min(candidate),
            None => candidate,
        });
        child
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Record `signal` as the cause, then cancel.
    pub fn cancel_with_signal(&self, signal: Signal) {
        let _ = self
            .signal
            .compare_exchange(0, signal as i32, Ordering::SeqCst, Ordering::SeqCst);
        self.token.cancel();
    }

    /// True once cancelled explicitly, by an ancestor, or by deadline.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline_expired()
    }

    pub fn deadline_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The signal recorded by [`Cancellation::cancel_with_signal`], if any.
    pub fn signal(&self) -> Option<Signal> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }
}
