//! Process handles and their lifecycle
//!
//! A handle's state only moves forward:
//!
//! ```text
//! Pending --> Running --> Exited(code)
//!    |           |
//!    +-----------+------> Errored(error)
//! ```
//!
//! Every transition is recorded as a `ProcessEvent`. Subscribers get the
//! recorded history first and live events after, so listening late never
//! loses the `Spawn` event. `Exit` is always the last event and always
//! arrives exactly once.

use super::error::ProcessError;
use super::events::{Receiver, Sender, channel};
use super::pid::Pid;
use super::stdio::{InputStream, OutputStream, ResolvedStdio};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Exit code of a process that ended in error
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Process state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, image not loaded yet
    Pending,
    /// Image loaded, entry point running
    Running,
    /// Entry point returned
    Exited(i32),
    /// Loading or running the image failed
    Errored(ProcessError),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Errored(_))
    }
}

/// Lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The image is loaded
    Spawn,
    /// Loading or running failed
    Error(ProcessError),
    /// The process ended; carries the exit code
    Exit(Option<i32>),
}

impl ProcessEvent {
    /// Event name as a host event emitter would call it
    pub fn name(&self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Error(_) => "error",
            Self::Exit(_) => "exit",
        }
    }
}

struct Lifecycle {
    state: ProcessState,
    history: Vec<ProcessEvent>,
    subscribers: Vec<Sender<ProcessEvent>>,
    waiters: Vec<Waker>,
}

impl Lifecycle {
    fn emit(&mut self, event: ProcessEvent) {
        let last = matches!(event, ProcessEvent::Exit(_));
        // Dropped receivers just stop listening
        for subscriber in &self.subscribers {
            let _ = subscriber.send(event.clone());
        }
        self.history.push(event);

        if last {
            for subscriber in self.subscribers.drain(..) {
                subscriber.close();
            }
            for waker in self.waiters.drain(..) {
                waker.wake();
            }
        }
    }
}

struct Inner {
    pid: Pid,
    command: String,
    args: Vec<String>,
    stdin: InputStream,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    lifecycle: RefCell<Lifecycle>,
}

/// A handle to one emulated process
///
/// Cloning gives another handle onto the same process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Rc<Inner>,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Pid, command: &str, args: &[String], stdio: ResolvedStdio) -> Self {
        Self {
            inner: Rc::new(Inner {
                pid,
                command: command.to_string(),
                args: args.to_vec(),
                stdin: stdio.stdin,
                stdout: stdio.stdout,
                stderr: stdio.stderr,
                lifecycle: RefCell::new(Lifecycle {
                    state: ProcessState::Pending,
                    history: Vec::new(),
                    subscribers: Vec::new(),
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    /// The name the process was invoked as
    pub fn command(&self) -> &str {
        &self.inner.command
    }

    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    pub fn stdin(&self) -> &InputStream {
        &self.inner.stdin
    }

    /// `None` when output is discarded
    pub fn stdout(&self) -> Option<&OutputStream> {
        self.inner.stdout.as_ref()
    }

    /// `None` when output is discarded
    pub fn stderr(&self) -> Option<&OutputStream> {
        self.inner.stderr.as_ref()
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lifecycle.borrow().state.clone()
    }

    /// Exit code once terminated; errors report `FAILURE_EXIT_CODE`
    pub fn exit_code(&self) -> Option<i32> {
        match self.inner.lifecycle.borrow().state {
            ProcessState::Exited(code) => Some(code),
            ProcessState::Errored(_) => Some(FAILURE_EXIT_CODE),
            ProcessState::Pending | ProcessState::Running => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lifecycle.borrow().state.is_terminal()
    }

    /// Events so far
    pub fn history(&self) -> Vec<ProcessEvent> {
        self.inner.lifecycle.borrow().history.clone()
    }

    /// Subscribe to lifecycle events, starting with those already emitted.
    /// The stream ends after `Exit`.
    pub fn events(&self) -> Receiver<ProcessEvent> {
        let (tx, rx) = channel();
        let mut lifecycle = self.inner.lifecycle.borrow_mut();
        for event in &lifecycle.history {
            let _ = tx.send(event.clone());
        }
        if lifecycle.state.is_terminal() {
            tx.close();
        } else {
            lifecycle.subscribers.push(tx);
        }
        rx
    }

    /// Resolves with the exit code once the process terminates
    pub fn wait(&self) -> WaitFuture {
        WaitFuture {
            handle: self.clone(),
        }
    }

    /// Forward bytes to stdout, dropping them if stdout is discarded
    pub(crate) fn write_stdout(&self, bytes: &[u8]) {
        if let Some(stdout) = &self.inner.stdout {
            let _ = stdout.write_all(bytes);
        }
    }

    /// Forward bytes to stderr, dropping them if stderr is discarded
    pub(crate) fn write_stderr(&self, bytes: &[u8]) {
        if let Some(stderr) = &self.inner.stderr {
            let _ = stderr.write_all(bytes);
        }
    }

    /// Pending -> Running. Returns false if the handle was not pending.
    pub(crate) fn mark_running(&self) -> bool {
        let mut lifecycle = self.inner.lifecycle.borrow_mut();
        if lifecycle.state != ProcessState::Pending {
            return false;
        }
        lifecycle.state = ProcessState::Running;
        lifecycle.emit(ProcessEvent::Spawn);
        true
    }

    /// Running -> Exited(code)
    pub(crate) fn finish(&self, code: i32) -> bool {
        let mut lifecycle = self.inner.lifecycle.borrow_mut();
        if lifecycle.state.is_terminal() {
            return false;
        }
        lifecycle.state = ProcessState::Exited(code);
        lifecycle.emit(ProcessEvent::Exit(Some(code)));
        true
    }

    /// Pending|Running -> Errored(error), then the forced exit
    pub(crate) fn fail(&self, error: ProcessError) -> bool {
        let mut lifecycle = self.inner.lifecycle.borrow_mut();
        if lifecycle.state.is_terminal() {
            return false;
        }
        lifecycle.state = ProcessState::Errored(error.clone());
        lifecycle.emit(ProcessEvent::Error(error));
        lifecycle.emit(ProcessEvent::Exit(Some(FAILURE_EXIT_CODE)));
        true
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("command", &self.inner.command)
            .field("args", &self.inner.args)
            .field("state", &self.inner.lifecycle.borrow().state)
            .finish()
    }
}

/// Future returned by `ProcessHandle::wait`
pub struct WaitFuture {
    handle: ProcessHandle,
}

impl Future for WaitFuture {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        if let Some(code) = self.handle.exit_code() {
            return Poll::Ready(code);
        }
        self.handle
            .inner
            .lifecycle
            .borrow_mut()
            .waiters
            .push(cx.waker().clone());
        Poll::Pending
    }
}
