//! POSIX PTY backend
//!
//! Allocation uses `openpty(3)`. The launcher resolves the program and
//! builds every C string before `fork`, so the child branch only makes
//! async-signal-safe calls: `setsid`, `TIOCSCTTY`, `dup2`, `execve`.
//!
//! `execve` failures in the child are reported back through a close-on-exec
//! pipe: the child writes its `errno` and exits with 127, the parent reads
//! either the errno or end-of-file (exec succeeded).

use std::convert::Infallible;
use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::openpty;
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::termios::Termios;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execve, fork, pipe2, setsid, ForkResult, Pid};
use tracing::debug;

use super::{Controller, Pty, PtyBackend, Spawned, Subordinate, WindowSize};
use crate::command::{CommandSpec, SpawnFlags};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::lifecycle::{ChildProcess, ExitStatus};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// `openpty` + `fork`/`execve` backend
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixBackend;

impl PtyBackend for UnixBackend {
    fn name(&self) -> &'static str {
        "openpty"
    }

    fn allocate(&self, size: WindowSize) -> Result<Pty> {
        let winsize = size.to_winsize();
        let pty = openpty(Some(&winsize), None::<&Termios>).map_err(|e| Error::allocation(self.name(), e))?;

        // Neither side may leak into the child beyond the dup2'd copies.
        for fd in [&pty.master, &pty.slave] {
            set_cloexec(fd.as_raw_fd()).map_err(|e| Error::allocation(self.name(), e))?;
        }

        let input = File::from(pty.master);
        let output = input
            .try_clone()
            .map_err(|e| Error::allocation(self.name(), e))?;
        debug!(cols = size.cols, rows = size.rows, "allocated pty");

        Ok(Pty {
            controller: Controller {
                input: Endpoint::controller(input),
                output: Endpoint::controller(output),
            },
            subordinate: Subordinate::Terminal(pty.slave),
        })
    }

    fn spawn(&self, subordinate: Subordinate, command: &CommandSpec, _flags: SpawnFlags) -> Result<Spawned> {
        let Subordinate::Terminal(terminal) = subordinate;
        let program = command.program();

        let path = resolve_program(program, command.env_value("PATH").as_deref())
            .map_err(|e| Error::spawn(program, e))?;
        let exec = ExecArgs::new(&path, command).map_err(|e| Error::spawn(program, e))?;
        let (report_rx, report_tx) = pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::spawn(program, e))?;

        // SAFETY: the child branch only calls async-signal-safe functions
        // before execve or _exit.
        match unsafe { fork() }.map_err(|e| Error::spawn(program, e))? {
            ForkResult::Child => exec_child(terminal.as_raw_fd(), &exec, report_tx),
            ForkResult::Parent { child } => {
                drop(report_tx);
                // The child holds the subordinate side now; the controller
                // must see the hang-up once it exits.
                drop(terminal);

                match read_exec_error(report_rx) {
                    Ok(None) => {
                        debug!(pid = child.as_raw(), path = %path.display(), "spawned child");
                        Ok(Spawned {
                            child: Arc::new(UnixChild::new(child)),
                            agent: None,
                        })
                    }
                    Ok(Some(errno)) => {
                        let _ = waitpid(child, None);
                        Err(Error::spawn(program, io::Error::from_raw_os_error(errno)))
                    }
                    Err(e) => {
                        let _ = kill(child, Signal::SIGKILL);
                        let _ = waitpid(child, None);
                        Err(Error::spawn(program, e))
                    }
                }
            }
        }
    }
}

/// Everything `execve` needs, allocated before forking
struct ExecArgs {
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl ExecArgs {
    fn new(path: &Path, command: &CommandSpec) -> io::Result<Self> {
        let argv = std::iter::once(command.program())
            .chain(command.get_args().iter().map(OsString::as_os_str))
            .map(cstring)
            .collect::<io::Result<Vec<_>>>()?;

        let envp = command
            .environment()
            .into_iter()
            .map(|(key, value)| {
                let mut pair = key;
                pair.push("=");
                pair.push(value);
                cstring(&pair)
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            path: cstring(path.as_os_str())?,
            argv,
            envp,
        })
    }
}

fn cstring(s: &OsStr) -> io::Result<CString> {
    CString::new(s.as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Child branch of the fork. Never returns.
fn exec_child(terminal: RawFd, exec: &ExecArgs, report: OwnedFd) -> ! {
    let result = (|| -> nix::Result<Infallible> {
        setsid()?;

        // SAFETY: TIOCSCTTY on the subordinate descriptor after setsid
        if unsafe { libc::ioctl(terminal, libc::TIOCSCTTY as _, 0) } < 0 {
            return Err(Errno::last());
        }

        redirect_onto(terminal, &[libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO])?;

        // SAFETY: restores the default disposition; the Rust runtime in the
        // parent ignores SIGPIPE and exec would keep that.
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }?;

        execve(&exec.path, &exec.argv, &exec.envp)
    })();

    let errno = match result {
        Err(e) => e as i32,
        Ok(never) => match never {},
    };
    let _ = File::from(report).write_all(&errno.to_ne_bytes());

    // SAFETY: _exit skips destructors and atexit handlers copied from the parent
    unsafe { libc::_exit(127) }
}

/// Make each of `targets` refer to `terminal` and survive `execve`.
///
/// `openpty` may hand out a standard descriptor number when the parent
/// started with one closed. `dup2` onto itself is a no-op that leaves
/// close-on-exec set, so the flag is cleared explicitly.
fn redirect_onto(terminal: RawFd, targets: &[RawFd]) -> nix::Result<()> {
    for &fd in targets {
        dup2(terminal, fd)?;
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    }
    Ok(())
}

fn read_exec_error(report: OwnedFd) -> io::Result<Option<i32>> {
    let mut file = File::from(report);
    let mut buf = [0u8; 4];
    let mut filled = 0;

    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    match filled {
        0 => Ok(None),
        4 => Ok(Some(i32::from_ne_bytes(buf))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated exec error report",
        )),
    }
}

fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(drop)
}

/// Find `program` the way `execvp` would, without forking first
pub(crate) fn resolve_program(program: &OsStr, search_path: Option<&OsStr>) -> io::Result<PathBuf> {
    if program.is_empty() {
        return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }
    if program.as_bytes().contains(&b'/') {
        return Ok(PathBuf::from(program));
    }

    // Like execvp, a match that cannot be executed is reported as EACCES
    // unless a later directory has a usable one.
    let search_path = search_path.unwrap_or(OsStr::new(DEFAULT_PATH));
    let mut denied = false;
    for dir in env::split_paths(search_path) {
        let candidate = if dir.as_os_str().is_empty() {
            PathBuf::from(".").join(program)
        } else {
            dir.join(program)
        };
        match Candidate::check(&candidate) {
            Candidate::Executable => return Ok(candidate),
            Candidate::Denied => denied = true,
            Candidate::Missing => {}
        }
    }

    let errno = if denied { libc::EACCES } else { libc::ENOENT };
    Err(io::Error::from_raw_os_error(errno))
}

enum Candidate {
    Executable,
    Denied,
    Missing,
}

impl Candidate {
    fn check(path: &Path) -> Self {
        match path.metadata() {
            Ok(m) if m.is_file() && m.permissions().mode() & 0o111 != 0 => Candidate::Executable,
            Ok(m) if m.is_file() => Candidate::Denied,
            _ => Candidate::Missing,
        }
    }
}

/// A forked child process
#[derive(Debug)]
pub struct UnixChild {
    pid: Pid,
    /// Status read by the one successful `waitpid`
    reaped: Mutex<Option<ExitStatus>>,
}

impl UnixChild {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            reaped: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn reaped(&self) -> Option<ExitStatus> {
        *self.reaped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, status: ExitStatus) -> ExitStatus {
        *self
            .reaped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(status)
    }

    fn reaped_elsewhere(&self) -> io::Result<ExitStatus> {
        self.reaped()
            .ok_or_else(|| io::Error::from(Errno::ECHILD))
    }
}

impl ChildProcess for UnixChild {
    fn id(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.reaped() {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => Ok(decode(status).map(|s| self.store(s))),
            Err(Errno::ECHILD) => self.reaped_elsewhere().map(Some),
            Err(e) => Err(e.into()),
        }
    }

    fn wait(&self) -> io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.reaped() {
                return Ok(status);
            }
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(status) = decode(status) {
                        return Ok(self.store(status));
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return self.reaped_elsewhere(),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn terminate(&self) -> io::Result<()> {
        if self.reaped().is_some() {
            return Ok(());
        }
        kill(self.pid, Signal::SIGHUP).map_err(io::Error::from)
    }
}

/// Only exits and signal deaths end a child; stop/continue reports do not.
fn decode(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled(signal as i32)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Monitor;
    use std::fs;

    fn read_all(endpoint: &mut Endpoint) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match endpoint.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn spawn(program: &str, args: &[&str]) -> Result<(Controller, Spawned)> {
        let backend = UnixBackend;
        let Pty { controller, subordinate } = backend.allocate(WindowSize::default())?;
        let command = CommandSpec::new(program).args(args.iter().copied());
        let spawned = backend.spawn(subordinate, &command, SpawnFlags::default())?;
        Ok((controller, spawned))
    }

    #[test]
    fn test_allocate_sets_window_size() {
        let pty = UnixBackend.allocate(WindowSize::new(100, 30)).unwrap();
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let fd = pty.controller.input.as_raw_fd();
        let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut ws) };
        assert_eq!(result, 0);
        assert_eq!(WindowSize::from(ws), WindowSize::new(100, 30));
    }

    #[test]
    fn test_spawn_echo() {
        let (mut controller, spawned) = spawn("echo", &["hello"]).unwrap();
        let output = read_all(&mut controller.output);
        assert!(output.contains("hello"), "unexpected output: {output:?}");
        assert_eq!(spawned.child.wait().unwrap(), ExitStatus::Exited(0));
    }

    #[test]
    fn test_exit_code_and_signal() {
        let (_controller, spawned) = spawn("/bin/sh", &["-c", "exit 7"]).unwrap();
        assert_eq!(spawned.child.wait().unwrap(), ExitStatus::Exited(7));
        // A second wait must not touch the OS again.
        assert_eq!(spawned.child.try_wait().unwrap(), Some(ExitStatus::Exited(7)));

        let (_controller, spawned) = spawn("/bin/sh", &["-c", "kill -TERM $$"]).unwrap();
        assert_eq!(spawned.child.wait().unwrap(), ExitStatus::Signaled(libc::SIGTERM));
    }

    #[test]
    fn test_child_has_controlling_terminal() {
        let (mut controller, spawned) = spawn("/bin/sh", &["-c", "test -t 0 && test -t 1 && echo TTY_OK"]).unwrap();
        let output = read_all(&mut controller.output);
        assert!(output.contains("TTY_OK"), "unexpected output: {output:?}");
        assert_eq!(spawned.child.wait().unwrap(), ExitStatus::Exited(0));
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = spawn("pty-relay-no-such-command", &[]).err().unwrap();
        match err {
            Error::SpawnFailed { program, source } => {
                assert_eq!(program, "pty-relay-no-such-command");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exec_failure_reported_through_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-binary");
        fs::write(&path, [0u8, 1, 2, 3]).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        let err = spawn(path.to_str().unwrap(), &[]).err().unwrap();
        assert!(matches!(err, Error::SpawnFailed { .. }), "unexpected error: {err}");
    }

    #[test]
    fn test_resolve_program() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let search = env::join_paths(["/nonexistent-dir", dir.path().to_str().unwrap()]).unwrap();
        assert_eq!(resolve_program(OsStr::new("tool"), Some(search.as_os_str())).unwrap(), tool);

        let err = resolve_program(OsStr::new("missing"), Some(search.as_os_str())).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

        let err = resolve_program(OsStr::new(""), Some(search.as_os_str())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        assert_eq!(
            resolve_program(OsStr::new("./local/tool"), None).unwrap(),
            PathBuf::from("./local/tool")
        );
    }

    #[test]
    fn test_resolve_program_reports_permission_denied() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let plain = first.path().join("tool");
        fs::write(&plain, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&plain, fs::Permissions::from_mode(0o644)).unwrap();

        let search = env::join_paths([first.path()]).unwrap();
        let err = resolve_program(OsStr::new("tool"), Some(search.as_os_str())).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        // An executable match later on the path still wins.
        let tool = second.path().join("tool");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        let search = env::join_paths([first.path(), second.path()]).unwrap();
        assert_eq!(resolve_program(OsStr::new("tool"), Some(search.as_os_str())).unwrap(), tool);
    }

    #[test]
    fn test_redirect_clears_close_on_exec() {
        let (terminal_fd, _peer) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (other_fd, _other_peer) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (terminal, other) = (terminal_fd.as_raw_fd(), other_fd.as_raw_fd());

        // The terminal already sits on one of the targets.
        redirect_onto(terminal, &[terminal, other]).unwrap();

        for fd in [terminal, other] {
            let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
            assert!(!flags.contains(FdFlag::FD_CLOEXEC), "fd {fd} still close-on-exec");
        }
        let same = |fd: RawFd| {
            let stat = nix::sys::stat::fstat(fd).unwrap();
            (stat.st_dev, stat.st_ino)
        };
        assert_eq!(same(terminal), same(other));
    }

    #[test]
    fn test_dropped_monitor_reaps_hung_up_child() {
        let (_controller, spawned) = spawn("/bin/sh", &["-c", "exec sleep 30"]).unwrap();
        let pid = Pid::from_raw(spawned.child.id() as i32);
        drop(Monitor::new(spawned.child, spawned.agent, SpawnFlags::default()));

        // Nothing left to wait for: the drop already collected the zombie.
        assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
    }
}
