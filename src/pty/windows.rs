//! ConPTY backend for Windows
//!
//! The pseudo console sits between two anonymous pipes: the relay writes the
//! child's input into one and reads its output from the other. The pseudo
//! console is the backend agent; closing it ends the output pipe, so it is
//! shut down as soon as the child's exit is recorded.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Console::{ClosePseudoConsole, CreatePseudoConsole, COORD, HPCON};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess, InitializeProcThreadAttributeList,
    TerminateProcess, UpdateProcThreadAttribute, WaitForSingleObject, CREATE_UNICODE_ENVIRONMENT,
    EXTENDED_STARTUPINFO_PRESENT, INFINITE, LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION,
    STARTUPINFOEXW,
};

use super::{Controller, Pty, PtyBackend, Spawned, Subordinate, WindowSize};
use crate::command::{CommandSpec, SpawnFlags};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::lifecycle::{Agent, ChildProcess, ExitStatus};

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

/// ConPTY pseudo console backend
#[derive(Debug, Default, Clone, Copy)]
pub struct ConPtyBackend;

impl PtyBackend for ConPtyBackend {
    fn name(&self) -> &'static str {
        "conpty"
    }

    fn allocate(&self, size: WindowSize) -> Result<Pty> {
        // Input pipe (we write, the console reads)
        let (input_read, input_write) = anonymous_pipe().map_err(|e| Error::allocation(self.name(), e))?;
        // Output pipe (the console writes, we read)
        let (output_read, output_write) = anonymous_pipe().map_err(|e| Error::allocation(self.name(), e))?;

        let size = COORD {
            X: size.cols as i16,
            Y: size.rows as i16,
        };
        let hpc = unsafe {
            CreatePseudoConsole(
                size,
                HANDLE(input_read.as_raw_handle()),
                HANDLE(output_write.as_raw_handle()),
                0,
            )
        }
        .map_err(|e| Error::allocation(self.name(), e))?;

        // The pseudo console duplicated the far ends; ours must close so the
        // output pipe ends when the console does.
        drop(input_read);
        drop(output_write);
        debug!(cols = size.X, rows = size.Y, "created pseudo console");

        Ok(Pty {
            controller: Controller {
                input: Endpoint::controller(File::from(input_write)),
                output: Endpoint::controller(File::from(output_read)),
            },
            subordinate: Subordinate::PseudoConsole(PseudoConsole { hpc: Some(hpc) }),
        })
    }

    fn spawn(&self, subordinate: Subordinate, command: &CommandSpec, _flags: SpawnFlags) -> Result<Spawned> {
        let Subordinate::PseudoConsole(console) = subordinate;
        let program = command.program();
        let hpc = console
            .hpc
            .ok_or_else(|| Error::spawn(program, io::Error::other("pseudo console already closed")))?;

        let mut attributes = AttributeList::with_pseudo_console(hpc).map_err(|e| Error::spawn(program, e))?;

        let mut startup_info = STARTUPINFOEXW::default();
        startup_info.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        startup_info.lpAttributeList = attributes.as_mut_ptr();

        let mut command_line: Vec<u16> = command
            .command_line()
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let environment = environment_block(&command.environment());
        let mut process_info = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                false,
                EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
                Some(environment.as_ptr() as *const _),
                PCWSTR::null(),
                &startup_info.StartupInfo,
                &mut process_info,
            )
        }
        .map_err(|e| Error::spawn(program, e))?;

        // SAFETY: both handles come from a successful CreateProcessW and are
        // owned by nobody else.
        let process = unsafe { OwnedHandle::from_raw_handle(process_info.hProcess.0) };
        drop(unsafe { OwnedHandle::from_raw_handle(process_info.hThread.0) });
        debug!(pid = process_info.dwProcessId, "spawned child");

        Ok(Spawned {
            child: Arc::new(WindowsChild::new(process, process_info.dwProcessId)),
            agent: Some(Box::new(console)),
        })
    }
}

fn anonymous_pipe() -> io::Result<(OwnedHandle, OwnedHandle)> {
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    unsafe { CreatePipe(&mut read, &mut write, None, 0) }.map_err(io::Error::from)?;
    // SAFETY: CreatePipe returned two fresh handles
    Ok(unsafe {
        (
            OwnedHandle::from_raw_handle(read.0),
            OwnedHandle::from_raw_handle(write.0),
        )
    })
}

/// `KEY=VALUE\0...\0\0`, as `CREATE_UNICODE_ENVIRONMENT` expects
fn environment_block(vars: &[(OsString, OsString)]) -> Vec<u16> {
    let mut block = Vec::new();
    for (key, value) in vars {
        block.extend(key.encode_wide());
        block.push(u16::from(b'='));
        block.extend(value.encode_wide());
        block.push(0);
    }
    if vars.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// Process-thread attribute list carrying the pseudo console
struct AttributeList {
    buffer: Vec<u8>,
    initialized: bool,
}

impl AttributeList {
    fn with_pseudo_console(hpc: HPCON) -> io::Result<Self> {
        let mut size: usize = 0;
        // Sizing call; fails by design with ERROR_INSUFFICIENT_BUFFER.
        let _ = unsafe { InitializeProcThreadAttributeList(LPPROC_THREAD_ATTRIBUTE_LIST::default(), 1, 0, &mut size) };

        let mut list = Self {
            buffer: vec![0u8; size],
            initialized: false,
        };
        unsafe { InitializeProcThreadAttributeList(list.as_mut_ptr(), 1, 0, &mut size) }.map_err(io::Error::from)?;
        list.initialized = true;

        unsafe {
            UpdateProcThreadAttribute(
                list.as_mut_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                Some(hpc.0 as *const _),
                mem::size_of::<HPCON>(),
                None,
                None,
            )
        }
        .map_err(io::Error::from)?;

        Ok(list)
    }

    fn as_mut_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_mut_ptr() as *mut _)
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { DeleteProcThreadAttributeList(self.as_mut_ptr()) };
        }
    }
}

/// The ConPTY pseudo console, closed exactly once
#[derive(Debug)]
pub struct PseudoConsole {
    hpc: Option<HPCON>,
}

// Safety: HPCON is an opaque handle; ClosePseudoConsole may run on any thread
unsafe impl Send for PseudoConsole {}

impl PseudoConsole {
    fn close(&mut self) {
        if let Some(hpc) = self.hpc.take() {
            unsafe { ClosePseudoConsole(hpc) };
        }
    }
}

impl Agent for PseudoConsole {
    fn shutdown(&mut self) {
        self.close();
    }
}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        self.close();
    }
}

/// A process created on a pseudo console
#[derive(Debug)]
pub struct WindowsChild {
    process: OwnedHandle,
    pid: u32,
    reaped: Mutex<Option<ExitStatus>>,
}

impl WindowsChild {
    pub fn new(process: OwnedHandle, pid: u32) -> Self {
        Self {
            process,
            pid,
            reaped: Mutex::new(None),
        }
    }

    fn handle(&self) -> HANDLE {
        HANDLE(self.process.as_raw_handle())
    }

    fn reaped(&self) -> Option<ExitStatus> {
        *self.reaped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Only valid once the process handle is signaled
    fn read_exit_code(&self) -> io::Result<ExitStatus> {
        let mut code: u32 = 0;
        unsafe { GetExitCodeProcess(self.handle(), &mut code) }.map_err(io::Error::from)?;
        let status = ExitStatus::from_exit_code(code);
        Ok(*self
            .reaped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(status))
    }
}

impl ChildProcess for WindowsChild {
    fn id(&self) -> u32 {
        self.pid
    }

    fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.reaped() {
            return Ok(Some(status));
        }
        let result = unsafe { WaitForSingleObject(self.handle(), 0) };
        if result == WAIT_OBJECT_0 {
            self.read_exit_code().map(Some)
        } else if result == WAIT_TIMEOUT {
            Ok(None)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn wait(&self) -> io::Result<ExitStatus> {
        if let Some(status) = self.reaped() {
            return Ok(status);
        }
        let result = unsafe { WaitForSingleObject(self.handle(), INFINITE) };
        if result == WAIT_OBJECT_0 {
            self.read_exit_code()
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn terminate(&self) -> io::Result<()> {
        if self.reaped().is_some() {
            return Ok(());
        }
        unsafe { TerminateProcess(self.handle(), 1) }.map_err(io::Error::from)
    }
}
