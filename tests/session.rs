//! End-to-end tests for relay sessions
//!
//! These run real children on real pseudo-terminals, with pipes standing in
//! for the invoking terminal.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use pty_relay::command::SpawnFlags;
use pty_relay::pty::{Pty, Spawned, Subordinate};
use pty_relay::{native_backend, CommandSpec, Endpoint, Error, ExitStatus, PtyBackend, RelayConfig, Session, Strategy, WindowSize};

/// A backend whose allocation always fails
#[derive(Default)]
struct NoPtys {
    spawns: AtomicUsize,
}

impl PtyBackend for NoPtys {
    fn name(&self) -> &'static str {
        "no-ptys"
    }

    fn allocate(&self, _size: WindowSize) -> pty_relay::Result<Pty> {
        Err(Error::AllocationFailed {
            backend: self.name(),
            source: io::Error::other("out of pseudo-terminals"),
        })
    }

    fn spawn(&self, _subordinate: Subordinate, command: &CommandSpec, _flags: SpawnFlags) -> pty_relay::Result<Spawned> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Err(Error::SpawnFailed {
            program: command.program().to_string_lossy().into_owned(),
            source: io::Error::other("unreachable"),
        })
    }
}

#[test]
fn test_allocation_failure_spawns_nothing() {
    let backend = NoPtys::default();
    let command = CommandSpec::from_args(["true"]);
    let err = Session::launch(&backend, &command, WindowSize::default()).err().unwrap();

    assert!(matches!(err, Error::AllocationFailed { backend: "no-ptys", .. }));
    assert!(err.to_string().contains("out of pseudo-terminals"));
    assert_eq!(backend.spawns.load(Ordering::SeqCst), 0);
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::fd::OwnedFd;

    fn pipe() -> (Endpoint, Endpoint) {
        let (rx, tx): (OwnedFd, OwnedFd) = nix::unistd::pipe().unwrap();
        (Endpoint::from(rx), Endpoint::from(tx))
    }

    /// Run `script` under `/bin/sh -c` with nothing typed
    fn run_script(strategy: Strategy, script: &str) -> (pty_relay::Result<ExitStatus>, Vec<u8>) {
        let command = CommandSpec::from_args(["/bin/sh", "-c", script]);
        let session = Session::launch(native_backend(), &command, WindowSize::new(100, 30)).unwrap();

        let (stdin_rx, stdin_tx) = pipe();
        let (mut stdout_rx, stdout_tx) = pipe();
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

    const STRATEGIES: [Strategy; 2] = [Strategy::Readiness, Strategy::Threaded];

    #[test]
    fn test_exit_codes_pass_through() {
        for strategy in STRATEGIES {
            let (result, _) = run_script(strategy, "exit 0");
            assert_eq!(result.unwrap(), ExitStatus::Exited(0), "{strategy}");

            let (result, _) = run_script(strategy, "exit 7");
            let status = result.unwrap();
            assert_eq!(status, ExitStatus::Exited(7), "{strategy}");
            assert_eq!(status.code(), 7);
        }
    }

    #[test]
    fn test_signal_termination_is_reported() {
        for strategy in STRATEGIES {
            let (result, _) = run_script(strategy, "kill -TERM $$");
            let status = result.unwrap();
            assert_eq!(status, ExitStatus::Signaled(15), "{strategy}");
            assert_eq!(status.code(), 143);
        }
    }

    #[test]
    fn test_child_sees_terminal_environment() {
        for strategy in STRATEGIES {
            let (result, out) = run_script(strategy, "[ -t 0 ] && [ -t 1 ] && printf '%s %s' \"$TERM\" \"$(stty size)\"");
            assert_eq!(result.unwrap(), ExitStatus::Exited(0), "{strategy}");
            assert_eq!(String::from_utf8_lossy(&out), "xterm-256color 30 100", "{strategy}");
        }
    }

    #[test]
    fn test_output_before_exit_arrives() {
        for strategy in STRATEGIES {
            let (result, out) = run_script(strategy, "i=0; while [ $i -lt 200 ]; do printf 0123456789; i=$((i+1)); done; exit 3");
            assert_eq!(result.unwrap(), ExitStatus::Exited(3), "{strategy}");
            assert_eq!(out, b"0123456789".repeat(200), "{strategy}");
        }
    }

    #[test]
    fn test_missing_command_is_spawn_failure() {
        let command = CommandSpec::from_args(["pty-relay-test-no-such-command"]);
        let err = Session::launch(native_backend(), &command, WindowSize::default()).err().unwrap();
        match err {
            Error::SpawnFailed { program, source } => {
                assert_eq!(program, "pty-relay-test-no-such-command");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_typed_input_reaches_child() {
        let command = CommandSpec::from_args(["/bin/sh", "-c", "read a b; exit $((a + b))"]);
        let session = Session::launch(native_backend(), &command, WindowSize::default()).unwrap();

        let (stdin_rx, mut stdin_tx) = pipe();
        let (mut stdout_rx, stdout_tx) = pipe();
        stdin_tx.write_all(b"4 5\n").unwrap();
        let reader = thread::spawn(move || {
            let mut out = Vec::new();
            stdout_rx.read_to_end(&mut out).unwrap();
            out
        });

        let status = session.run(stdin_rx, stdout_tx, &RelayConfig::default()).unwrap();
        assert_eq!(status, ExitStatus::Exited(9));
        // The line discipline echoes what was typed.
        assert!(String::from_utf8_lossy(&reader.join().unwrap()).contains("4 5"));
    }
}
