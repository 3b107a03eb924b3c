//! Error types surfaced by the runtime.
//!
//! Recoverable failures (kernel registration errors, configuration problems, misuse
//! outside a scheduler) are reported through [`Error`]. Intercepted system calls keep
//! the conventional [`std::io::Error`] channel so callers see `ETIMEDOUT`, `EBADF`
//! and friends exactly as a blocking call would report them.

use crate::reactor::Event;

use std::io;
use std::os::unix::io::RawFd;

/// Errors reported by the scheduler, reactor and configuration layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An underlying system call failed.
    #[error("system call failed: {0}")]
    Io(#[from] io::Error),

    /// The event is already registered on the descriptor.
    #[error("event {event:?} already registered on fd {fd}")]
    EventExists { fd: RawFd, event: Event },

    /// The descriptor number is negative.
    #[error("invalid file descriptor {0}")]
    InvalidFd(RawFd),

    /// The operation needs a running fiber scheduler on the current thread.
    #[error("no scheduler is running on the current thread")]
    NotInScheduler,

    /// A configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A configuration value does not match the registered variable's type.
    #[error("configuration value for `{name}` is not a valid {expected}: {message}")]
    ConfigType {
        name: String,
        expected: &'static str,
        message: String,
    },
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        match error {
            Error::Io(error) => error,
            Error::InvalidFd(_) => io::Error::from_raw_os_error(libc::EBADF),
            Error::EventExists { .. } => io::Error::new(io::ErrorKind::AlreadyExists, error),
            other => io::Error::other(other),
        }
    }
}
