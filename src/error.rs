//! Error types for relay sessions

use std::io;
use thiserror::Error;

/// Relay error type
#[derive(Error, Debug)]
pub enum Error {
    /// The pseudo-terminal (or its backend) could not be created
    #[error("failed to allocate pseudo-terminal ({backend}): {source}")]
    AllocationFailed {
        backend: &'static str,
        #[source]
        source: io::Error,
    },

    /// The child process could not be started
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A read or write against an endpoint failed after the child started
    #[error("relay I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn allocation(backend: &'static str, source: impl Into<io::Error>) -> Self {
        Error::AllocationFailed {
            backend,
            source: source.into(),
        }
    }

    pub(crate) fn spawn(program: impl AsRef<std::ffi::OsStr>, source: impl Into<io::Error>) -> Self {
        Error::SpawnFailed {
            program: program.as_ref().to_string_lossy().into_owned(),
            source: source.into(),
        }
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_os_error() {
        let err = Error::spawn("missing-tool", io::Error::from_raw_os_error(2));
        let msg = err.to_string();
        assert!(msg.contains("missing-tool"), "{msg}");
        assert!(msg.contains("os error 2"), "{msg}");

        let err = Error::allocation("openpty", io::Error::from_raw_os_error(24));
        assert!(err.to_string().contains("openpty"));
        assert!(err.to_string().contains("os error 24"));
    }
}
