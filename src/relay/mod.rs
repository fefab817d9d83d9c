//! I/O relay engine
//!
//! A relay pumps bytes through two [`Direction`]s until the [`Monitor`]
//! records an exit status:
//!
//! - input: standard input to the PTY controller
//! - output: PTY controller to standard output
//!
//! Two strategies are available. [`Readiness`] multiplexes both directions on
//! one thread with `poll(2)` and is only built on POSIX. [`Threaded`] runs one
//! blocking worker per direction and works everywhere.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::app::RelayConfig;
use crate::endpoint::{Endpoint, Interrupter, Interruptible};
use crate::error::Error;
use crate::lifecycle::{ExitStatus, Monitor};
use crate::pty::Controller;

#[cfg(unix)]
mod readiness;
mod threaded;

#[cfg(unix)]
pub use readiness::Readiness;
pub use threaded::Threaded;

/// Smallest per-direction buffer
pub const MIN_BUFFER_SIZE: usize = 256;
/// Default per-direction buffer
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Which way bytes flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionKind {
    /// Standard input to the PTY
    Input,
    /// PTY to standard output
    Output,
}

impl DirectionKind {
    pub fn name(&self) -> &'static str {
        match self {
            DirectionKind::Input => "input",
            DirectionKind::Output => "output",
        }
    }
}

/// Result of one read-then-write step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// This many bytes were read and fully written
    Forwarded(usize),
    /// The source reached end-of-stream; nothing was written
    EndOfStream,
}

/// One flow of bytes from a source to a sink through a fixed buffer
#[derive(Debug)]
pub struct Direction<S = Endpoint> {
    kind: DirectionKind,
    source: S,
    sink: Endpoint,
    buf: Vec<u8>,
}

impl<S: Read> Direction<S> {
    /// `capacity` is raised to [`MIN_BUFFER_SIZE`] if smaller
    pub fn new(kind: DirectionKind, source: S, sink: Endpoint, capacity: usize) -> Self {
        Self {
            kind,
            source,
            sink,
            buf: vec![0; capacity.max(MIN_BUFFER_SIZE)],
        }
    }

    pub fn kind(&self) -> DirectionKind {
        self.kind
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Read once from the source, then write everything read to the sink.
    ///
    /// Interrupted reads are retried. A partial write is never reported:
    /// either all bytes reach the sink or an error is returned.
    pub fn transfer(&mut self) -> io::Result<Transfer> {
        let n = loop {
            match self.source.read(&mut self.buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            return Ok(Transfer::EndOfStream);
        }
        self.sink.write_all(&self.buf[..n])?;
        self.sink.flush()?;
        Ok(Transfer::Forwarded(n))
    }
}

impl Direction {
    /// Swap the source for one whose pending read can be interrupted
    pub fn interruptible(self) -> io::Result<(Direction<Interruptible>, Interrupter)> {
        let Direction { kind, source, sink, buf } = self;
        let (source, interrupter) = source.interruptible()?;
        Ok((Direction { kind, source, sink, buf }, interrupter))
    }
}

/// Both directions of a session
#[derive(Debug)]
pub struct Directions {
    pub input: Direction,
    pub output: Direction,
}

impl Directions {
    /// Wire the caller's streams to a PTY controller
    pub fn new(stdin: Endpoint, stdout: Endpoint, controller: Controller, capacity: usize) -> Self {
        Self {
            input: Direction::new(DirectionKind::Input, stdin, controller.input, capacity),
            output: Direction::new(DirectionKind::Output, controller.output, stdout, capacity),
        }
    }
}

/// A strategy for running both directions to completion
pub trait Relay {
    fn name(&self) -> &'static str;

    /// Relay until the monitor has recorded an exit status and return it.
    ///
    /// Fatal I/O errors are handed to [`Monitor::fail`]; the returned status
    /// is then [`ExitStatus::RelayFailed`].
    fn run(&self, directions: Directions, monitor: &mut Monitor) -> ExitStatus;
}

/// Relay strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Readiness where supported, threaded otherwise
    #[default]
    Auto,
    Readiness,
    Threaded,
}

impl Strategy {
    /// Whether the readiness strategy is built for this platform
    pub fn readiness_supported() -> bool {
        cfg!(unix)
    }

    /// The concrete strategy to run
    pub fn resolve(self) -> Strategy {
        match self {
            Strategy::Auto if Self::readiness_supported() => Strategy::Readiness,
            Strategy::Auto => Strategy::Threaded,
            Strategy::Readiness if !Self::readiness_supported() => {
                warn!("readiness relay is not supported on this platform, using threaded relay");
                Strategy::Threaded
            }
            other => other,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Auto => "auto",
            Strategy::Readiness => "readiness",
            Strategy::Threaded => "threaded",
        };
        f.write_str(name)
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Strategy::Auto),
            "readiness" => Ok(Strategy::Readiness),
            "threaded" => Ok(Strategy::Threaded),
            other => Err(Error::Config(format!(
                "unknown relay strategy `{other}` (expected auto, readiness or threaded)"
            ))),
        }
    }
}

/// Build the relay selected by `config`
pub fn engine(config: &RelayConfig) -> Box<dyn Relay> {
    let drain = config.drain_timeout();
    match config.strategy.resolve() {
        #[cfg(unix)]
        Strategy::Readiness => Box::new(Readiness::new(drain)),
        _ => Box::new(Threaded::new(drain)),
    }
}
