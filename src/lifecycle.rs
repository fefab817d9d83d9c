//! Child lifecycle monitoring
//!
//! The [`Monitor`] is the single place where a session's exit status is
//! recorded. It owns the child handle and the backend agent, and decides
//! when the agent is shut down and whether the child is hung up on teardown.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::command::SpawnFlags;

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The child exited normally with this code
    Exited(i32),
    /// The child was terminated by this signal
    Signaled(i32),
    /// The child died with this NTSTATUS error code (an unhandled exception
    /// or a console close on Windows)
    Faulted(u32),
    /// The relay failed with an I/O error before the child exited
    RelayFailed,
}

impl ExitStatus {
    /// Exit code for the relaying process
    pub fn code(&self) -> i32 {
        match *self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signal) => 128 + signal,
            // Same value a Windows parent would see from the child itself
            ExitStatus::Faulted(status) => status as i32,
            ExitStatus::RelayFailed => 1,
        }
    }

    /// Decode a Windows process exit code.
    ///
    /// Codes with both NTSTATUS severity bits set (`0xC...`) mean the process
    /// was torn down abnormally, for example `0xC0000005` for an access
    /// violation or `0xC000013A` for Ctrl+C. Anything else is a normal exit.
    pub fn from_exit_code(code: u32) -> Self {
        const SEVERITY_ERROR: u32 = 0xC000_0000;
        if code & SEVERITY_ERROR == SEVERITY_ERROR {
            ExitStatus::Faulted(code)
        } else {
            ExitStatus::Exited(code as i32)
        }
    }

    pub fn success(&self) -> bool {
        *self == ExitStatus::Exited(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with code {code}"),
            ExitStatus::Signaled(signal) => write!(f, "terminated by signal {signal}"),
            ExitStatus::Faulted(status) => write!(f, "terminated abnormally with status {status:#010X}"),
            ExitStatus::RelayFailed => write!(f, "relay failed"),
        }
    }
}

/// A spawned child process.
///
/// Implementations cache the reaped status: once `try_wait` or `wait` has
/// observed the exit, later calls return the same status without asking the
/// OS again.
pub trait ChildProcess: Send + Sync {
    /// OS process id
    fn id(&self) -> u32;

    /// Non-blocking check for exit
    fn try_wait(&self) -> io::Result<Option<ExitStatus>>;

    /// Block until the child exits
    fn wait(&self) -> io::Result<ExitStatus>;

    /// Hang up on the child (SIGHUP on POSIX, TerminateProcess on Windows)
    fn terminate(&self) -> io::Result<()>;
}

/// Auxiliary process or object brokering the PTY for the child
pub trait Agent: Send {
    /// Tear the agent down. Called at most once.
    fn shutdown(&mut self);
}

/// Records the exit status of one child, exactly once
pub struct Monitor {
    child: Arc<dyn ChildProcess>,
    agent: Option<Box<dyn Agent>>,
    flags: SpawnFlags,
    status: Option<ExitStatus>,
    failure: Option<io::Error>,
}

impl Monitor {
    pub fn new(child: Arc<dyn ChildProcess>, agent: Option<Box<dyn Agent>>, flags: SpawnFlags) -> Self {
        Self {
            child,
            agent,
            flags,
            status: None,
            failure: None,
        }
    }

    /// Shared handle to the child, for a thread that blocks on its exit
    pub fn child(&self) -> Arc<dyn ChildProcess> {
        Arc::clone(&self.child)
    }

    /// The recorded status, if the session has ended
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Non-blocking exit check
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.status.is_some() {
            return self.status;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => Some(self.record(status)),
            Ok(None) => None,
            Err(e) => Some(self.fail(e)),
        }
    }

    /// Block until the child exits
    pub fn wait(&mut self) -> ExitStatus {
        if let Some(status) = self.status {
            return status;
        }
        match self.child.wait() {
            Ok(status) => self.record(status),
            Err(e) => self.fail(e),
        }
    }

    /// Record the child's exit. The first recorded status wins.
    pub fn record(&mut self, status: ExitStatus) -> ExitStatus {
        if let Some(existing) = self.status {
            return existing;
        }
        debug!(pid = self.child.id(), %status, "child exited");
        self.status = Some(status);
        if self.flags.auto_shutdown {
            self.shutdown_agent();
        }
        status
    }

    /// Record a fatal relay error and hang up on the child without waiting
    pub fn fail(&mut self, err: io::Error) -> ExitStatus {
        if let Some(existing) = self.status {
            return existing;
        }
        error!(pid = self.child.id(), "relay failed: {err}");
        self.status = Some(ExitStatus::RelayFailed);
        self.failure = Some(err);
        if let Err(e) = self.child.terminate() {
            warn!("failed to hang up child: {e}");
        }
        self.shutdown_agent();
        ExitStatus::RelayFailed
    }

    /// The I/O error behind a [`ExitStatus::RelayFailed`] status
    pub fn take_failure(&mut self) -> Option<io::Error> {
        self.failure.take()
    }

    fn reap_within(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                Ok(None) => {
                    debug!(pid = self.child.id(), "child still running after hangup");
                    return;
                }
                Ok(Some(_)) | Err(_) => return,
            }
        }
    }

    fn shutdown_agent(&mut self) {
        if let Some(mut agent) = self.agent.take() {
            debug!("shutting down backend agent");
            agent.shutdown();
        }
    }
}

/// How long a drop waits for a hung-up child to die before leaving it be
const REAP_GRACE: Duration = Duration::from_millis(200);

/// Hangs up on a still-running child when `exit_after_shutdown` is set, then
/// reaps it if it dies within [`REAP_GRACE`]. A child that outlives the grace
/// period is left for the caller to reap.
impl Drop for Monitor {
    fn drop(&mut self) {
        if self.flags.exit_after_shutdown {
            if let Ok(None) = self.child.try_wait() {
                let _ = self.child.terminate();
                self.reap_within(REAP_GRACE);
            }
        }
        self.shutdown_agent();
    }
}
