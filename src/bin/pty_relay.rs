//! PTY Relay
//!
//! Runs a command (or the user's shell) on a pseudo-terminal and relays the
//! invoking terminal to it. Exits with the child's exit code, `128 + signal`
//! if the child was killed, the raw NTSTATUS code if a Windows child faulted,
//! or 1 if the relay itself failed.

use std::process;

use pty_relay::app::{init_logging, RelayConfig};
use pty_relay::terminal::{self, RawModeGuard};
use pty_relay::{native_backend, CommandSpec, Endpoint, ExitStatus, Session};

fn main() {
    init_logging();

    let code = match run() {
        Ok(ExitStatus::Signaled(signal)) => {
            eprintln!("pty-relay: child terminated by signal {signal}");
            ExitStatus::Signaled(signal).code()
        }
        Ok(status @ ExitStatus::Faulted(_)) => {
            eprintln!("pty-relay: child {status}");
            status.code()
        }
        Ok(status) => status.code(),
        Err(e) => {
            eprintln!("pty-relay: {e}");
            ExitStatus::RelayFailed.code()
        }
    };
    process::exit(code);
}

fn run() -> pty_relay::Result<ExitStatus> {
    let config = RelayConfig::load()?;
    let command = CommandSpec::from_args(std::env::args_os().skip(1)).env("TERM", &config.term);
    let size = terminal::size().unwrap_or_default();
    tracing::debug!(cols = size.cols, rows = size.rows, "initial window size");

    let session = Session::launch(native_backend(), &command, size.or_default())?;
    let stdin = Endpoint::stdin()?;
    let stdout = Endpoint::stdout()?;

    // Dropped before main reports anything, so messages land on a sane terminal.
    let _raw = RawModeGuard::new()?;
    session.run(stdin, stdout, &config)
}
