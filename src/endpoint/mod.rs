//! OS I/O endpoints
//!
//! An [`Endpoint`] owns exactly one OS I/O object: a PTY controller
//! descriptor, a pipe end, or a duplicate of a standard stream. Reads and
//! writes go straight to the OS; closing is explicit or happens on drop.
//!
//! The threaded relay needs to unblock a reader that is parked in a blocking
//! read. [`Endpoint::interruptible`] splits an endpoint into an
//! [`Interruptible`] reader and an [`Interrupter`] that forces the pending
//! read to return end-of-stream.

use std::fs::File;
use std::io::{self, Read, Write};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as sys;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as sys;

pub use sys::{Interrupter, Interruptible};

/// What an endpoint is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Pipe, file or standard stream
    Stream,
    /// Controller side of a pseudo-terminal
    Controller,
}

/// An owned, readable and/or writable OS handle
#[derive(Debug)]
pub struct Endpoint {
    file: File,
    kind: EndpointKind,
}

impl Endpoint {
    /// Duplicate of the process's standard input
    pub fn stdin() -> io::Result<Self> {
        sys::dup_stdin().map(Self::from)
    }

    /// Duplicate of the process's standard output
    pub fn stdout() -> io::Result<Self> {
        sys::dup_stdout().map(Self::from)
    }

    /// Wrap the controller side of a pseudo-terminal.
    ///
    /// A controller endpoint reports the terminal hang-up (the subordinate
    /// side closed by every process) as end-of-stream instead of an error.
    pub fn controller(file: File) -> Self {
        Self {
            file,
            kind: EndpointKind::Controller,
        }
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Duplicate the underlying OS handle
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
            kind: self.kind,
        })
    }

    /// Close the handle, reporting any error the OS returns
    pub fn close(self) -> io::Result<()> {
        sys::close(self.file)
    }

    /// Split into a reader whose pending read can be forced to end-of-stream
    pub fn interruptible(self) -> io::Result<(Interruptible, Interrupter)> {
        sys::interruptible(self)
    }

    fn read_shared(&self, buf: &mut [u8]) -> io::Result<usize> {
        match (&self.file).read(buf) {
            Err(e) if self.kind == EndpointKind::Controller && sys::is_hangup(&e) => Ok(0),
            result => result,
        }
    }
}

impl From<File> for Endpoint {
    fn from(file: File) -> Self {
        Self {
            file,
            kind: EndpointKind::Stream,
        }
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_shared(buf)
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
