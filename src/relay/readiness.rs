//! Single-threaded relay driven by `poll(2)`

use std::io;
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};

use super::{Direction, Directions, Relay, Transfer};
use crate::lifecycle::{ExitStatus, Monitor};

/// Multiplexes both directions on the calling thread.
///
/// `poll` blocks without a timeout; the only bounded wait is the drain of
/// the output direction after the child has exited.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    drain: Duration,
}

impl Readiness {
    pub fn new(drain: Duration) -> Self {
        Self { drain }
    }

    /// Forward whatever output the child left behind.
    ///
    /// The whole drain ends at `self.drain` after it starts, even if
    /// something still holds the subordinate side open and keeps writing.
    fn drain(&self, output: &mut Direction) {
        let deadline = Instant::now() + self.drain;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("output drain timed out");
                return;
            }
            let ready = {
                let mut fds = [PollFd::new(output.source().as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, poll_timeout(remaining)) {
                    Ok(0) => false,
                    Ok(_) => is_ready(&fds[0]).unwrap_or(false),
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        warn!("poll failed while draining output: {e}");
                        false
                    }
                }
            };
            if !ready {
                debug!("output drain timed out");
                return;
            }
            match output.transfer() {
                Ok(Transfer::Forwarded(_)) => {}
                Ok(Transfer::EndOfStream) => return,
                Err(e) => {
                    warn!("error while draining output: {e}");
                    return;
                }
            }
        }
    }
}

/// Round up so a sub-millisecond remainder still waits instead of spinning
fn poll_timeout(remaining: Duration) -> PollTimeout {
    let millis = remaining.as_micros().div_ceil(1000);
    PollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX))
}

#[derive(Debug, Default)]
struct Ready {
    input: bool,
    output: bool,
}

/// Block until at least one live source is ready
fn wait_ready(input: Option<&Direction>, output: &Direction) -> io::Result<Ready> {
    loop {
        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(output.source().as_fd(), PollFlags::POLLIN));
        if let Some(input) = input {
            fds.push(PollFd::new(input.source().as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        let mut ready = Ready {
            output: is_ready(&fds[0])?,
            input: false,
        };
        if let Some(fd) = fds.get(1) {
            ready.input = is_ready(fd)?;
        }
        return Ok(ready);
    }
}

/// Readable, hung up, or in error: in every case a read will not block
fn is_ready(fd: &PollFd<'_>) -> io::Result<bool> {
    let revents = fd.revents().unwrap_or_else(PollFlags::empty);
    if revents.contains(PollFlags::POLLNVAL) {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    Ok(revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}

impl Relay for Readiness {
    fn name(&self) -> &'static str {
        "readiness"
    }

    fn run(&self, directions: Directions, monitor: &mut Monitor) -> ExitStatus {
        let Directions { mut input, mut output } = directions;
        let mut input_live = true;

        loop {
            let ready = match wait_ready(input_live.then_some(&input), &output) {
                Ok(ready) => ready,
                Err(e) => return monitor.fail(e),
            };

            if ready.input {
                match input.transfer() {
                    Ok(Transfer::Forwarded(_)) => {}
                    Ok(Transfer::EndOfStream) => {
                        debug!("stdin reached end of stream");
                        input_live = false;
                    }
                    Err(e) => return monitor.fail(e),
                }
            }

            if ready.output {
                match output.transfer() {
                    Ok(Transfer::Forwarded(_)) => {}
                    Ok(Transfer::EndOfStream) => {
                        debug!("pty hung up, waiting for child");
                        return monitor.wait();
                    }
                    Err(e) => return monitor.fail(e),
                }
            }

            if let Some(status) = monitor.poll_exit() {
                if status != ExitStatus::RelayFailed {
                    self.drain(&mut output);
                }
                return status;
            }
        }
    }
}
