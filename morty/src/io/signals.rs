//! OS signal intake for the orchestrator.
//!
//! `main` owns one [`SignalHandler`]. While installed, SIGINT and SIGTERM are
//! masked on the installing thread (and every thread it spawns afterwards), and
//! a watcher thread picks them up with `sigwait`. A received signal is recorded
//! on the root [`Cancellation`]; running executors see the cancellation and
//! forward the same signal to their child process group. A second signal while
//! already cancelled escalates to SIGKILL for every registered child.
//!
//! The mask is not inherited by agents: `std::process::Command` clears the
//! signal mask in the child before exec.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use nix::sys::pthread::{Pthread, pthread_kill, pthread_self};
use nix::sys::signal::{SigSet, Signal};
use tracing::{debug, info, warn};

use crate::io::cancel::Cancellation;
use crate::io::registry::ProcessRegistry;

/// Wakes the watcher for shutdown. Ignored when not stopping.
const WAKE: Signal = Signal::SIGUSR2;

struct Watcher {
    thread: JoinHandle<()>,
    tid: Pthread,
    mask: SigSet,
}

pub struct SignalHandler {
    root: Cancellation,
    registry: ProcessRegistry,
    stopping: Arc<AtomicBool>,
    watcher: Option<Watcher>,
}

impl std::fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHandler")
            .field("installed", &self.watcher.is_some())
            .field("received", &self.received())
            .finish_non_exhaustive()
    }
}

impl SignalHandler {
    /// A handler that is not listening to the OS. Signals arrive via [`SignalHandler::deliver`].
    pub fn new(root: Cancellation, registry: ProcessRegistry) -> Self {
        Self {
            root,
            registry,
            stopping: Arc::new(AtomicBool::new(false)),
            watcher: None,
        }
    }

    /// Mask SIGINT/SIGTERM on this thread and start the watcher.
    ///
    /// Call from the main thread before spawning other threads, so that none of
    /// them can receive the signals with their default disposition.
    pub fn install(root: Cancellation, registry: ProcessRegistry) -> Result<Self> {
        let mut handler = Self::new(root, registry);
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.add(WAKE);
        mask.thread_block().context("block termination signals")?;

        let (tid_tx, tid_rx) = std::sync::mpsc::channel();
        let root = handler.root.clone();
        let registry = handler.registry.clone();
        let stopping = Arc::clone(&handler.stopping);
        let spawned = thread::Builder::new()
            .name("morty-signals".to_string())
            .spawn(move || {
                let _ = tid_tx.send(pthread_self());
                watch(mask, &root, &registry, &stopping);
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                let _ = mask.thread_unblock();
                return Err(err).context("spawn signal watcher");
            }
        };
        let tid = tid_rx.recv().context("signal watcher exited during startup")?;
        debug!("signal watcher installed");
        handler.watcher = Some(Watcher { thread, tid, mask });
        Ok(handler)
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.root
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// The first signal received, if any.
    pub fn received(&self) -> Option<Signal> {
        self.root.signal()
    }

    /// Handle `signal` as if the OS had delivered it.
    pub fn deliver(&self, signal: Signal) {
        deliver(&self.root, &self.registry, signal);
    }

    /// Stop the watcher and restore the signal mask. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(watcher) = self.watcher.take() else {
            return;
        };
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(err) = pthread_kill(watcher.tid, WAKE) {
            warn!(err = %err, "failed to wake signal watcher");
        } else if watcher.thread.join().is_err() {
            warn!("signal watcher panicked");
        }
        if let Err(err) = watcher.mask.thread_unblock() {
            warn!(err = %err, "failed to restore signal mask");
        }
        debug!("signal watcher stopped");
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watch(mask: SigSet, root: &Cancellation, registry: &ProcessRegistry, stopping: &AtomicBool) {
    loop {
        match mask.wait() {
            Ok(WAKE) => {
                if stopping.load(Ordering::SeqCst) {
                    return;
                }
            }
            Ok(signal) => deliver(root, registry, signal),
            Err(err) => {
                warn!(err = %err, "sigwait failed, signal watcher exiting");
                return;
            }
        }
    }
}

fn deliver(root: &Cancellation, registry: &ProcessRegistry, signal: Signal) {
    if root.is_cancelled() {
        let killed = registry.terminate_all(Signal::SIGKILL);
        warn!(signal = signal.as_str(), killed, "second signal, killing running agents");
        return;
    }
    info!(signal = signal.as_str(), "signal received, stopping after current job");
    root.cancel_with_signal(signal);
}
