//! Pseudo-terminal backends
//!
//! A [`PtyBackend`] allocates a pseudo-terminal and launches a child on its
//! subordinate side. The native backend is resolved once with
//! [`native_backend`] and passed by reference to [`Session::launch`].
//!
//! - POSIX: `openpty` + `fork`/`execve` ([`UnixBackend`])
//! - Windows: ConPTY pseudo console over two anonymous pipes ([`ConPtyBackend`])
//!
//! [`Session::launch`]: crate::Session::launch

use std::sync::Arc;

use crate::command::{CommandSpec, SpawnFlags};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::lifecycle::{Agent, ChildProcess};

mod size;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use size::WindowSize;
#[cfg(unix)]
pub use unix::{UnixBackend, UnixChild};
#[cfg(windows)]
pub use windows::{ConPtyBackend, PseudoConsole, WindowsChild};

/// The relay's side of the PTY
#[derive(Debug)]
pub struct Controller {
    /// Written by the relay; becomes the child's terminal input
    pub input: Endpoint,
    /// Read by the relay; carries the child's terminal output
    pub output: Endpoint,
}

/// The side of the PTY the child attaches to
#[derive(Debug)]
pub enum Subordinate {
    /// Subordinate terminal descriptor, made the child's controlling terminal
    #[cfg(unix)]
    Terminal(std::os::fd::OwnedFd),
    /// Pseudo console attached to the child at process creation
    #[cfg(windows)]
    PseudoConsole(PseudoConsole),
}

/// A freshly allocated pseudo-terminal
#[derive(Debug)]
pub struct Pty {
    pub controller: Controller,
    pub subordinate: Subordinate,
}

/// A child running on a PTY
pub struct Spawned {
    pub child: Arc<dyn ChildProcess>,
    /// Backend agent that must be torn down with the session
    pub agent: Option<Box<dyn Agent>>,
}

/// Capability interface of a PTY backend
pub trait PtyBackend: Sync {
    /// Short name used in error messages and logs
    fn name(&self) -> &'static str;

    /// Allocate a pseudo-terminal of the given initial size
    fn allocate(&self, size: WindowSize) -> Result<Pty>;

    /// Launch `command` with its standard streams bound to `subordinate`
    fn spawn(&self, subordinate: Subordinate, command: &CommandSpec, flags: SpawnFlags) -> Result<Spawned>;
}

/// The backend for the platform this binary was built for
pub fn native_backend() -> &'static dyn PtyBackend {
    #[cfg(unix)]
    {
        static BACKEND: UnixBackend = UnixBackend;
        &BACKEND
    }
    #[cfg(windows)]
    {
        static BACKEND: ConPtyBackend = ConPtyBackend;
        &BACKEND
    }
}
