//! A child running on a PTY, and the relay that drives it

use tracing::{debug, info};

use crate::app::RelayConfig;
use crate::command::{CommandSpec, SpawnFlags};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::lifecycle::{ExitStatus, Monitor};
use crate::pty::{Controller, Pty, PtyBackend, Spawned, WindowSize};
use crate::relay::{self, Directions};

/// One relayed child.
///
/// Field order is drop order: the monitor hangs up on the child and closes
/// the backend agent before the controller endpoints go away.
pub struct Session {
    monitor: Monitor,
    controller: Controller,
}

impl Session {
    /// Allocate a PTY from `backend` and start `command` on it.
    ///
    /// Nothing is spawned if allocation fails. If spawning fails the PTY is
    /// released before returning.
    pub fn launch(backend: &dyn PtyBackend, command: &CommandSpec, size: WindowSize) -> Result<Self> {
        let size = size.or_default();
        let Pty { controller, subordinate } = backend.allocate(size)?;

        let flags = SpawnFlags::default();
        let Spawned { child, agent } = backend.spawn(subordinate, command, flags)?;
        info!(
            backend = backend.name(),
            pid = child.id(),
            program = %command.program().to_string_lossy(),
            "child started"
        );

        Ok(Self {
            monitor: Monitor::new(child, agent, flags),
            controller,
        })
    }

    /// OS process id of the child
    pub fn pid(&self) -> u32 {
        self.monitor.child().id()
    }

    /// Relay between `stdin`/`stdout` and the PTY until the child exits.
    ///
    /// Abnormal termination of the child is a status, not an error. An I/O
    /// failure of the relay itself is returned as [`Error::Io`] after the
    /// child has been hung up on.
    pub fn run(self, stdin: Endpoint, stdout: Endpoint, config: &RelayConfig) -> Result<ExitStatus> {
        let Session { mut monitor, controller } = self;
        let directions = Directions::new(stdin, stdout, controller, config.buffer_size);

        let relay = relay::engine(config);
        debug!(strategy = relay.name(), "relay started");
        let status = relay.run(directions, &mut monitor);
        debug!(%status, "relay finished");

        match monitor.take_failure() {
            Some(err) => Err(Error::Io(err)),
            None => Ok(status),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pty::native_backend;
    use crate::relay::tests::pipe;
    use crate::relay::Strategy;
    use std::io::{Read, Write};
    use std::thread;

    fn run_with(strategy: Strategy, command: CommandSpec, typed: &[u8]) -> (Result<ExitStatus>, Vec<u8>) {
        let session = Session::launch(native_backend(), &command, WindowSize::default()).unwrap();
        assert!(session.pid() > 0);

        let (stdin_rx, mut stdin_tx) = pipe();
        let (mut stdout_rx, stdout_tx) = pipe();
        stdin_tx.write_all(typed).unwrap();

        let reader = thread::spawn(move || {
            let mut out = Vec::new();
            stdout_rx.read_to_end(&mut out).unwrap();
            out
        });

        let config = RelayConfig {
            strategy,
            ..RelayConfig::default()
        };
        let result = session.run(stdin_rx, stdout_tx, &config);
        drop(stdin_tx);
        (result, reader.join().unwrap())
    }

    #[test]
    fn test_session_reports_exit_code() {
        for strategy in [Strategy::Readiness, Strategy::Threaded] {
            let command = CommandSpec::new("/bin/sh").args(["-c", "exit 7"]);
            let (result, _) = run_with(strategy, command, b"");
            assert_eq!(result.unwrap(), ExitStatus::Exited(7), "{strategy}");
        }
    }

    #[test]
    fn test_session_relays_child_output() {
        for strategy in [Strategy::Readiness, Strategy::Threaded] {
            let command = CommandSpec::new("/bin/sh").args(["-c", "printf relayed"]);
            let (result, out) = run_with(strategy, command, b"");
            assert_eq!(result.unwrap(), ExitStatus::Exited(0), "{strategy}");
            assert_eq!(out, b"relayed", "{strategy}");
        }
    }

    #[test]
    fn test_session_relays_input_to_child() {
        for strategy in [Strategy::Readiness, Strategy::Threaded] {
            let command = CommandSpec::new("/bin/sh").args(["-c", "read line; printf '<%s>' \"$line\""]);
            let (result, out) = run_with(strategy, command, b"ping\n");
            assert_eq!(result.unwrap(), ExitStatus::Exited(0), "{strategy}");
            let out = String::from_utf8_lossy(&out);
            assert!(out.contains("<ping>"), "{strategy}: {out:?}");
        }
    }
}
