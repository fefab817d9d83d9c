//! PTY session relay
//!
//! Runs a child process on a pseudo-terminal and relays bytes between that
//! PTY and the caller's standard streams, so the child behaves as if it were
//! running interactively in a real terminal.
//!
//! - `pty`: PTY allocation and process launch (`openpty` on POSIX, ConPTY on Windows)
//! - `relay`: the readiness and threaded relay strategies
//! - `lifecycle`: child exit tracking and exit status
//! - `session`: ties a PTY, a child and a relay together
//!
//! ```no_run
//! use pty_relay::{native_backend, CommandSpec, Endpoint, RelayConfig, Session, WindowSize};
//!
//! let command = CommandSpec::from_args(["sh", "-c", "echo hello"]);
//! let session = Session::launch(native_backend(), &command, WindowSize::default())?;
//! let status = session.run(Endpoint::stdin()?, Endpoint::stdout()?, &RelayConfig::default())?;
//! std::process::exit(status.code());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod app;
pub mod command;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod pty;
pub mod relay;
pub mod session;
pub mod terminal;

pub use app::RelayConfig;
pub use command::{CommandSpec, SpawnFlags};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use lifecycle::ExitStatus;
pub use pty::{native_backend, PtyBackend, WindowSize};
pub use relay::Strategy;
pub use session::Session;
