//! The terminal the relay was started from
//!
//! Raw mode hands every keystroke (including control characters) to the
//! child's line discipline instead of our own.

use std::io::{self, IsTerminal};

use tracing::debug;

use crate::pty::WindowSize;

/// Size of the invoking terminal, if standard output is one
pub fn size() -> Option<WindowSize> {
    let size = sys::size()?;
    (size.cols > 0 && size.rows > 0).then_some(size)
}

/// RAII guard for raw terminal mode on standard input.
///
/// Does nothing when standard input is not a terminal.
pub struct RawModeGuard {
    saved: Option<sys::Saved>,
}

impl RawModeGuard {
    pub fn new() -> io::Result<Self> {
        if !io::stdin().is_terminal() {
            debug!("stdin is not a terminal, leaving it as is");
            return Ok(Self { saved: None });
        }
        let saved = sys::enter_raw()?;
        debug!("terminal switched to raw mode");
        Ok(Self { saved: Some(saved) })
    }

    pub fn is_active(&self) -> bool {
        self.saved.is_some()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            sys::restore(saved);
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::io;

    use nix::sys::termios::{self, SetArg, Termios};

    use crate::pty::WindowSize;

    pub(super) type Saved = Termios;

    pub(super) fn enter_raw() -> io::Result<Termios> {
        let original = termios::tcgetattr(io::stdin())?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &raw)?;
        Ok(original)
    }

    pub(super) fn restore(original: Termios) {
        let _ = termios::tcsetattr(io::stdin(), SetArg::TCSAFLUSH, &original);
    }

    pub(super) fn size() -> Option<WindowSize> {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let result = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
        (result == 0).then(|| WindowSize::from(ws))
    }
}

#[cfg(windows)]
mod sys {
    use std::io;

    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Console::{
        GetConsoleMode, GetConsoleScreenBufferInfo, GetStdHandle, SetConsoleMode, CONSOLE_MODE,
        CONSOLE_SCREEN_BUFFER_INFO, ENABLE_ECHO_INPUT, ENABLE_LINE_INPUT, ENABLE_PROCESSED_INPUT,
        ENABLE_VIRTUAL_TERMINAL_INPUT, ENABLE_VIRTUAL_TERMINAL_PROCESSING, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
    };

    use crate::pty::WindowSize;

    pub(super) struct Saved {
        input: (HANDLE, CONSOLE_MODE),
        output: Option<(HANDLE, CONSOLE_MODE)>,
    }

    fn mode(handle: HANDLE) -> io::Result<CONSOLE_MODE> {
        let mut mode = CONSOLE_MODE::default();
        unsafe { GetConsoleMode(handle, &mut mode) }?;
        Ok(mode)
    }

    pub(super) fn enter_raw() -> io::Result<Saved> {
        let stdin = unsafe { GetStdHandle(STD_INPUT_HANDLE) }?;
        let input_mode = mode(stdin)?;
        let raw = (input_mode & !(ENABLE_LINE_INPUT | ENABLE_ECHO_INPUT | ENABLE_PROCESSED_INPUT))
            | ENABLE_VIRTUAL_TERMINAL_INPUT;
        unsafe { SetConsoleMode(stdin, raw) }?;

        // Output may be redirected; only a console needs VT processing.
        let stdout = unsafe { GetStdHandle(STD_OUTPUT_HANDLE) }?;
        let output = match mode(stdout) {
            Ok(output_mode) => {
                unsafe { SetConsoleMode(stdout, output_mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING) }?;
                Some((stdout, output_mode))
            }
            Err(_) => None,
        };

        Ok(Saved {
            input: (stdin, input_mode),
            output,
        })
    }

    pub(super) fn restore(saved: Saved) {
        let (stdin, input_mode) = saved.input;
        let _ = unsafe { SetConsoleMode(stdin, input_mode) };
        if let Some((stdout, output_mode)) = saved.output {
            let _ = unsafe { SetConsoleMode(stdout, output_mode) };
        }
    }

    pub(super) fn size() -> Option<WindowSize> {
        let stdout = unsafe { GetStdHandle(STD_OUTPUT_HANDLE) }.ok()?;
        let mut info = CONSOLE_SCREEN_BUFFER_INFO::default();
        unsafe { GetConsoleScreenBufferInfo(stdout, &mut info) }.ok()?;
        let cols = info.srWindow.Right - info.srWindow.Left + 1;
        let rows = info.srWindow.Bottom - info.srWindow.Top + 1;
        Some(WindowSize::new(u16::try_from(cols).ok()?, u16::try_from(rows).ok()?))
    }
}
