//! Supervised child processes with timeouts, graceful termination, and bounded output.
//!
//! [`ProcessExecutor::start`] spawns the child as its own process group and hands
//! the wait to a monitor thread. The monitor polls for exit, the timeout, and the
//! caller's [`Cancellation`] every tick. When termination is needed it sends a
//! graceful signal first and a SIGKILL once the grace period lapses. Natural exit
//! observed on a tick always wins over a pending termination.
//!
//! Background processes left in the group after the leader exits are given the
//! same treatment, so a stray daemon holding the output pipes cannot stall
//! [`ProcessHandle::wait`].

use std::fmt;
use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::cancel::Cancellation;
use crate::io::registry::{ProcessRegistry, send_signal};

/// Monitor poll interval.
const TICK: Duration = Duration::from_millis(25);

/// How long output pipes may stay open after the leader exits before the
/// rest of its process group is terminated.
const DRAIN: Duration = Duration::from_millis(200);

/// Whether to keep child output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Pipe stdout/stderr and keep up to `limit_bytes` of each.
    Capture { limit_bytes: usize },
    /// Inherit the parent's stdout/stderr. Nothing is kept.
    Stream,
}

/// Everything needed to start (or restart) an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Bytes written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    /// Time between the graceful signal and SIGKILL.
    pub grace_period: Duration,
    pub output: OutputMode,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            env: Vec::new(),
            stdin: None,
            timeout: None,
            grace_period: Duration::from_secs(5),
            output: OutputMode::Capture {
                limit_bytes: 1_000_000,
            },
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        match self.output {
            OutputMode::Capture { .. } => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputMode::Stream => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }
        cmd.process_group(0);
        cmd
    }
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Running,
    Completed,
    TimedOut,
    Killed,
    Errored,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessState::Created | ProcessState::Running)
    }
}

/// Record of a finished invocation. Present even when termination was forced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// Exit code, or `128 + signal` when the child died from a signal.
    pub exit_code: i32,
    /// `None` in stream mode.
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub duration: Duration,
    pub timed_out: bool,
    /// True for any non-natural termination.
    pub interrupted: bool,
    /// Signal that caused the interruption.
    pub signal: Option<Signal>,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.interrupted
    }

    /// Last `max_chars` characters of stderr, falling back to stdout.
    pub fn output_tail(&self, max_chars: usize) -> String {
        let source = match (&self.stderr, &self.stdout) {
            (Some(err), _) if !err.trim().is_empty() => err.as_str(),
            (_, Some(out)) => out.as_str(),
            _ => "",
        };
        let trimmed = source.trim();
        let skip = trimmed.chars().count().saturating_sub(max_chars);
        trimmed.chars().skip(skip).collect()
    }
}

/// Process lifecycle failures. Every post-spawn variant carries the partial result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("cancelled before start")]
    Cancelled,
    #[error("spawn {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("process timed out after {:?}", .0.duration)]
    TimedOut(ProcessResult),
    #[error("process killed")]
    Killed(ProcessResult),
    #[error("process interrupted by {}", signal_name(.0.signal))]
    Interrupted(ProcessResult),
    #[error("process wait failed: {message}")]
    Errored {
        message: String,
        result: ProcessResult,
    },
}

impl ProcessError {
    /// The partial result, when the process was started.
    pub fn result(&self) -> Option<&ProcessResult> {
        match self {
            ProcessError::Cancelled | ProcessError::Spawn { .. } => None,
            ProcessError::TimedOut(result)
            | ProcessError::Killed(result)
            | ProcessError::Interrupted(result)
            | ProcessError::Errored { result, .. } => Some(result),
        }
    }
}

fn signal_name(signal: Option<Signal>) -> &'static str {
    signal.map_or("cancellation", Signal::as_str)
}

/// Why the monitor is terminating the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    TimedOut,
    Killed,
    Interrupted(Option<Signal>),
}

#[derive(Debug)]
struct Lifecycle {
    state: ProcessState,
    pid: Option<u32>,
    interrupt: Option<Signal>,
    termination: Option<Termination>,
    outcome: Option<Result<ProcessResult, ProcessError>>,
}

struct Shared {
    spec: ProcessSpec,
    child: Mutex<Child>,
    lifecycle: Mutex<Lifecycle>,
    done: Condvar,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn child(&self) -> MutexGuard<'_, Child> {
        self.child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Starts supervised processes and tracks them in a [`ProcessRegistry`].
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    registry: ProcessRegistry,
}

impl ProcessExecutor {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Spawn `spec` under `cancel`. Fails without spawning if `cancel` already fired.
    #[instrument(skip_all, fields(program = %spec.program))]
    pub fn start(
        &self,
        spec: ProcessSpec,
        cancel: &Cancellation,
    ) -> Result<ProcessHandle, ProcessError> {
        if cancel.is_cancelled() {
            debug!("parent already cancelled, not spawning");
            return Err(ProcessError::Cancelled);
        }

        let started = Instant::now();
        let mut child = spec.to_command().spawn().map_err(|err| {
            error!(err = %err, "failed to spawn command");
            ProcessError::Spawn {
                program: spec.program.clone(),
                message: err.to_string(),
            }
        })?;
        let pid = child.id();
        self.registry.register(pid, &spec.program);
        info!(pid, "process started");

        let readers = take_readers(&mut child, &spec);
        let shared = Arc::new(Shared {
            spec,
            child: Mutex::new(child),
            lifecycle: Mutex::new(Lifecycle {
                state: ProcessState::Running,
                pid: Some(pid),
                interrupt: None,
                termination: None,
                outcome: None,
            }),
            done: Condvar::new(),
        });

        let monitor = {
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            let registry = self.registry.clone();
            thread::Builder::new()
                .name(format!("morty-monitor-{pid}"))
                .spawn(move || monitor(&shared, &cancel, &registry, readers, started))
        };
        let monitor = match monitor {
            Ok(handle) => Some(handle),
            Err(err) => {
                // Without a monitor nobody would reap the child.
                let _ = shared.child().kill();
                let _ = shared.child().wait();
                self.registry.remove(pid);
                return Err(ProcessError::Spawn {
                    program: shared.spec.program.clone(),
                    message: format!("spawn monitor thread: {err}"),
                });
            }
        };

        Ok(ProcessHandle {
            shared,
            executor: self.clone(),
            monitor: Mutex::new(monitor),
        })
    }

    /// Start and wait.
    pub fn run(
        &self,
        spec: ProcessSpec,
        cancel: &Cancellation,
    ) -> Result<ProcessResult, ProcessError> {
        self.start(spec, cancel)?.wait()
    }
}

/// A running (or finished) invocation. Safe to share across threads.
pub struct ProcessHandle {
    shared: Arc<Shared>,
    executor: ProcessExecutor,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("program", &self.shared.spec.program)
            .field("pid", &self.pid())
            .field("state", &self.state())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.shared.lifecycle().pid
    }

    pub fn state(&self) -> ProcessState {
        self.shared.lifecycle().state
    }

    pub fn running(&self) -> bool {
        !self.state().is_terminal()
    }

    /// The signal that caused (or is causing) a non-natural termination.
    pub fn interrupt_signal(&self) -> Option<Signal> {
        self.shared.lifecycle().interrupt
    }

    /// The spec this invocation was started from.
    pub fn descriptor(&self) -> &ProcessSpec {
        &self.shared.spec
    }

    /// Force-kill the process group. No-op once the process has exited.
    #[instrument(skip_all, fields(pid = ?self.pid()))]
    pub fn kill(&self) -> Result<()> {
        let mut child = self.shared.child();
        if child.try_wait().context("poll child")?.is_some() {
            debug!("kill requested after exit, ignoring");
            return Ok(());
        }
        {
            let mut lifecycle = self.shared.lifecycle();
            if lifecycle.state != ProcessState::Running {
                return Ok(());
            }
            lifecycle.state = ProcessState::Killed;
            lifecycle.termination = Some(Termination::Killed);
            lifecycle.interrupt = Some(Signal::SIGKILL);
        }
        info!("killing process");
        force_kill(&mut child);
        Ok(())
    }

    /// Block until the process finishes. Any number of callers may wait.
    pub fn wait(&self) -> Result<ProcessResult, ProcessError> {
        let outcome = {
            let mut lifecycle = self.shared.lifecycle();
            loop {
                if let Some(outcome) = &lifecycle.outcome {
                    break outcome.clone();
                }
                lifecycle = self
                    .shared
                    .done
                    .wait(lifecycle)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = monitor
            && handle.join().is_err()
        {
            warn!("process monitor thread panicked");
        }
        outcome
    }

    /// Start a fresh invocation with the same descriptor.
    pub fn resume(&self, cancel: &Cancellation) -> Result<ProcessHandle, ProcessError> {
        self.executor.start(self.shared.spec.clone(), cancel)
    }
}

type Reader = JoinHandle<Result<(Vec<u8>, usize)>>;

struct Readers {
    stdout: Option<Reader>,
    stderr: Option<Reader>,
    stdin: Option<JoinHandle<()>>,
}

fn take_readers(child: &mut Child, spec: &ProcessSpec) -> Readers {
    let stdin = match (child.stdin.take(), spec.stdin.clone()) {
        (Some(mut pipe), Some(input)) => Some(thread::spawn(move || {
            if let Err(err) = pipe.write_all(input.as_bytes()) {
                debug!(err = %err, "stdin closed early");
            }
        })),
        _ => None,
    };
    let (stdout, stderr) = match spec.output {
        OutputMode::Capture { limit_bytes } => (
            child
                .stdout
                .take()
                .map(|out| thread::spawn(move || read_stream_limited(out, limit_bytes))),
            child
                .stderr
                .take()
                .map(|err| thread::spawn(move || read_stream_limited(err, limit_bytes))),
        ),
        OutputMode::Stream => (None, None),
    };
    Readers {
        stdout,
        stderr,
        stdin,
    }
}

fn monitor(
    shared: &Shared,
    cancel: &Cancellation,
    registry: &ProcessRegistry,
    readers: Readers,
    started: Instant,
) {
    let pid = shared.lifecycle().pid.unwrap_or_default();
    let timeout_at = shared.spec.timeout.map(|timeout| started + timeout);
    let mut grace_deadline: Option<Instant> = None;
    let mut forced = false;

    let exit = loop {
        match poll_exit(&mut shared.child()) {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            Err(err) => break Err(err),
        }

        let termination = shared.lifecycle().termination;
        match termination {
            Some(Termination::Killed) => {}
            Some(_) => {
                if !forced && grace_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    warn!(pid, "grace period elapsed, killing");
                    force_kill(&mut shared.child());
                    forced = true;
                }
            }
            None => {
                let reason = if timeout_at.is_some_and(|at| Instant::now() >= at) {
                    Some((Termination::TimedOut, Signal::SIGTERM))
                } else if cancel.is_cancelled() {
                    let forwarded = cancel.signal();
                    Some((
                        Termination::Interrupted(forwarded),
                        forwarded.unwrap_or(Signal::SIGTERM),
                    ))
                } else {
                    None
                };
                if let Some((reason, signal)) = reason
                    && begin_termination(shared, reason, signal)
                {
                    grace_deadline = Some(Instant::now() + shared.spec.grace_period);
                    if shared.spec.grace_period.is_zero() {
                        force_kill(&mut shared.child());
                        forced = true;
                    }
                }
            }
        }
    };

    settle_group(pid, &readers, shared.spec.grace_period);
    if let Some(handle) = readers.stdin
        && handle.is_finished()
        && handle.join().is_err()
    {
        warn!(pid, "stdin writer panicked");
    }
    let (stdout, stdout_truncated) = collect(readers.stdout, "stdout");
    let (stderr, stderr_truncated) = collect(readers.stderr, "stderr");
    registry.remove(pid);

    let mut lifecycle = shared.lifecycle();
    let mut result = ProcessResult {
        exit_code: -1,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        duration: started.elapsed(),
        timed_out: false,
        interrupted: false,
        signal: None,
    };

    let outcome = match exit {
        Err(err) => {
            lifecycle.state = ProcessState::Errored;
            Err(ProcessError::Errored {
                message: format!("{err:#}"),
                result,
            })
        }
        Ok(status) => {
            result.exit_code = exit_code(status);
            // A child that handles the termination signal and exits cleanly still failed.
            if lifecycle.termination.is_some() && result.exit_code == 0 {
                result.exit_code = -1;
            }
            match lifecycle.termination {
                None => {
                    lifecycle.state = ProcessState::Completed;
                    Ok(result)
                }
                Some(Termination::TimedOut) => {
                    lifecycle.state = ProcessState::TimedOut;
                    result.timed_out = true;
                    result.interrupted = true;
                    result.signal = lifecycle.interrupt;
                    Err(ProcessError::TimedOut(result))
                }
                Some(Termination::Killed) => {
                    lifecycle.state = ProcessState::Killed;
                    result.interrupted = true;
                    result.signal = lifecycle.interrupt;
                    Err(ProcessError::Killed(result))
                }
                Some(Termination::Interrupted(signal)) => {
                    lifecycle.state = ProcessState::Killed;
                    result.interrupted = true;
                    result.signal = signal;
                    Err(ProcessError::Interrupted(result))
                }
            }
        }
    };
    match &outcome {
        Ok(result) => debug!(pid, exit_code = result.exit_code, "process finished"),
        Err(err) => warn!(pid, err = %err, "process ended abnormally"),
    }
    lifecycle.outcome = Some(outcome);
    drop(lifecycle);
    shared.done.notify_all();
}

impl Readers {
    /// True while any pipe thread is still attached to the child.
    fn open(&self) -> bool {
        let pending = |handle: &Option<Reader>| handle.as_ref().is_some_and(|h| !h.is_finished());
        pending(&self.stdout)
            || pending(&self.stderr)
            || self.stdin.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Poll until every pipe thread is done or `limit` passes.
    fn wait_closed(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.open() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(TICK.min(limit));
        }
        true
    }
}

/// Terminate whatever is left of the process group once the leader is gone.
///
/// Only acts when a group member still holds the output pipes: SIGTERM first,
/// SIGKILL once `grace` lapses.
fn settle_group(pid: u32, readers: &Readers, grace: Duration) {
    if readers.wait_closed(DRAIN) {
        return;
    }
    info!(pid, "output still open after exit, terminating process group");
    signal_group(pid, Signal::SIGTERM);
    if readers.wait_closed(grace) {
        return;
    }
    warn!(pid, "process group outlived grace period, killing");
    signal_group(pid, Signal::SIGKILL);
    if !readers.wait_closed(DRAIN) {
        warn!(pid, "output held open outside the process group, abandoning readers");
    }
}

fn signal_group(pid: u32, signal: Signal) {
    match send_signal(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pid, err = %err, signal = signal.as_str(), "killpg failed"),
    }
}

/// Check for exit, blocking at most one tick.
fn poll_exit(child: &mut Child) -> Result<Option<ExitStatus>> {
    if let Some(status) = child.try_wait().context("poll child")? {
        return Ok(Some(status));
    }
    child.wait_timeout(TICK).context("wait for child")
}

/// Record the termination reason and send the graceful signal.
///
/// Returns false if the process already exited or was explicitly killed.
fn begin_termination(shared: &Shared, reason: Termination, signal: Signal) -> bool {
    let mut child = shared.child();
    if matches!(child.try_wait(), Ok(Some(_))) {
        return false;
    }
    let mut lifecycle = shared.lifecycle();
    if lifecycle.termination.is_some() {
        return false;
    }
    lifecycle.termination = Some(reason);
    lifecycle.interrupt = Some(signal);
    drop(lifecycle);

    info!(pid = child.id(), signal = signal.as_str(), ?reason, "requesting termination");
    match send_signal(child.id(), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!(err = %err, "graceful signal failed, killing");
            force_kill(&mut child);
        }
    }
    true
}

fn force_kill(child: &mut Child) {
    match send_signal(child.id(), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(err = %err, "killpg failed"),
    }
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill after exit");
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

fn collect(handle: Option<Reader>, label: &str) -> (Option<String>, usize) {
    let Some(handle) = handle else {
        return (None, 0);
    };
    if !handle.is_finished() {
        // Something outside the group still writes here; joining would block.
        return (Some(String::new()), 0);
    }
    match join_output(handle) {
        Ok((bytes, truncated)) => {
            if truncated > 0 {
                warn!(stream = label, truncated, "output truncated");
            }
            (Some(String::from_utf8_lossy(&bytes).into_owned()), truncated)
        }
        Err(err) => {
            warn!(stream = label, err = %err, "failed to read output");
            (Some(String::new()), 0)
        }
    }
}

fn join_output(handle: Reader) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
