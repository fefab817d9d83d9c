//! POSIX endpoint support
//!
//! A pending read is interrupted through a wake pipe: the reader polls its
//! source together with the wake pipe and reports end-of-stream as soon as
//! the wake pipe becomes readable.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{close as close_fd, pipe2};

use super::Endpoint;

pub(super) fn dup_stdin() -> io::Result<File> {
    io::stdin().as_fd().try_clone_to_owned().map(File::from)
}

pub(super) fn dup_stdout() -> io::Result<File> {
    io::stdout().as_fd().try_clone_to_owned().map(File::from)
}

pub(super) fn close(file: File) -> io::Result<()> {
    close_fd(file.into_raw_fd()).map_err(io::Error::from)
}

/// The controller side of a PTY fails reads with `EIO` once no process
/// holds the subordinate side open.
pub(super) fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

pub(super) fn interruptible(endpoint: Endpoint) -> io::Result<(Interruptible, Interrupter)> {
    let (wake_rx, wake_tx) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    Ok((
        Interruptible {
            endpoint,
            wake: File::from(wake_rx),
        },
        Interrupter {
            wake: File::from(wake_tx),
        },
    ))
}

/// Reader half of an interruptible endpoint
#[derive(Debug)]
pub struct Interruptible {
    endpoint: Endpoint,
    wake: File,
}

impl Read for Interruptible {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (readable, woken) = {
                let mut fds = [
                    PollFd::new(self.endpoint.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
                (has_events(&fds[0]), has_events(&fds[1]))
            };

            if woken {
                return Ok(0);
            }
            if readable {
                return self.endpoint.read(buf);
            }
        }
    }
}

fn has_events(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| !r.is_empty())
}

/// Forces the paired [`Interruptible`] to report end-of-stream
#[derive(Debug)]
pub struct Interrupter {
    wake: File,
}

impl Interrupter {
    pub fn interrupt(&self) {
        // The wake pipe stays readable once written, so repeats are harmless.
        let _ = (&self.wake).write(&[1]);
    }
}

impl From<OwnedFd> for Endpoint {
    fn from(fd: OwnedFd) -> Self {
        Endpoint::from(File::from(fd))
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
