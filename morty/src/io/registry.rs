//! Thread-safe registry of live child processes for cleanup.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Live children keyed by pid, with the program name for diagnostics.
///
/// Cloning shares the same registry.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<BTreeMap<u32, String>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32, program: &str) {
        debug!(pid, program, "registering child process");
        self.lock().insert(pid, program.to_string());
    }

    pub fn remove(&self, pid: u32) -> bool {
        self.lock().remove(&pid).is_some()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.lock().contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Send `signal` to every registered process. Returns how many were signalled.
    ///
    /// Processes that already exited are dropped from the registry.
    pub fn terminate_all(&self, signal: Signal) -> usize {
        let mut sent = 0;
        let mut guard = self.lock();
        guard.retain(|pid, program| match send_signal(*pid, signal) {
            Ok(()) => {
                sent += 1;
                true
            }
            Err(Errno::ESRCH) => false,
            Err(err) => {
                warn!(pid, program = %program, err = %err, "failed to signal child");
                true
            }
        });
        sent
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, String>> {
        // Every mutation is a single map call, so a poisoned map is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// Children are spawned as group leaders so the agent's own subprocesses are
/// reached too.
pub(crate) fn send_signal(pid: u32, signal: Signal) -> Result<(), Errno> {
    let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    killpg(Pid::from_raw(raw), signal)
}
