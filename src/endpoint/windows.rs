//! Windows endpoint support
//!
//! A pending `ReadFile` is interrupted with `CancelIoEx`. The reader and the
//! interrupter share the endpoint through an `Arc`, so the handle being
//! cancelled stays open for as long as either side can touch it.

use std::fs::File;
use std::io::{self, Read};
use std::os::windows::io::{AsHandle, AsRawHandle, BorrowedHandle, IntoRawHandle, OwnedHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use windows::Win32::Foundation::{CloseHandle, ERROR_BROKEN_PIPE, ERROR_OPERATION_ABORTED, HANDLE};
use windows::Win32::System::IO::CancelIoEx;

use super::Endpoint;

pub(super) fn dup_stdin() -> io::Result<File> {
    io::stdin().as_handle().try_clone_to_owned().map(File::from)
}

pub(super) fn dup_stdout() -> io::Result<File> {
    io::stdout().as_handle().try_clone_to_owned().map(File::from)
}

pub(super) fn close(file: File) -> io::Result<()> {
    unsafe { CloseHandle(HANDLE(file.into_raw_handle())) }.map_err(io::Error::from)
}

pub(super) fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ERROR_BROKEN_PIPE.0 as i32)
}

pub(super) fn interruptible(endpoint: Endpoint) -> io::Result<(Interruptible, Interrupter)> {
    let endpoint = Arc::new(endpoint);
    let cancelled = Arc::new(AtomicBool::new(false));
    Ok((
        Interruptible {
            endpoint: Arc::clone(&endpoint),
            cancelled: Arc::clone(&cancelled),
        },
        Interrupter {
            endpoint,
            cancelled,
        },
    ))
}

/// Reader half of an interruptible endpoint
#[derive(Debug)]
pub struct Interruptible {
    endpoint: Arc<Endpoint>,
    cancelled: Arc<AtomicBool>,
}

impl Read for Interruptible {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(0);
        }
        match self.endpoint.read_shared(buf) {
            Err(e) if e.raw_os_error() == Some(ERROR_OPERATION_ABORTED.0 as i32) => Ok(0),
            result => result,
        }
    }
}

/// Forces the paired [`Interruptible`] to report end-of-stream
#[derive(Debug)]
pub struct Interrupter {
    endpoint: Arc<Endpoint>,
    cancelled: Arc<AtomicBool>,
}

impl Interrupter {
    /// Cancel the pending read, if any.
    ///
    /// A read issued after the cancellation sees the flag instead. A read
    /// entered between the flag check and `ReadFile` is only caught by a
    /// repeated call, which the threaded relay makes on every grace timeout.
    pub fn interrupt(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let handle = HANDLE(self.endpoint.file.as_raw_handle());
        unsafe {
            let _ = CancelIoEx(handle, None);
        }
    }
}

impl From<OwnedHandle> for Endpoint {
    fn from(handle: OwnedHandle) -> Self {
        Endpoint::from(File::from(handle))
    }
}

impl AsHandle for Endpoint {
    fn as_handle(&self) -> BorrowedHandle<'_> {
        self.file.as_handle()
    }
}
