//! Error classification shared by every layer.
//!
//! Classification happens once, where the OS error is observed, and is passed
//! upward untouched. `Retry` never leaves the loop that triggered it.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SocketError>;

/// Outcome of a send or receive that may stop part way.
pub type Transfer<T> = std::result::Result<T, Incomplete<T>>;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("timeout")]
    Timeout,

    #[error("closed")]
    Closed,

    #[error("connection refused")]
    Refused,

    /// Operation would block and the readiness wait succeeded; try again.
    #[error("retry")]
    Retry,

    #[error("failed to create socket: {0}")]
    CreateFailed(#[source] io::Error),

    #[error("out of memory")]
    OutOfMemory,

    #[error("{0}")]
    Io(#[from] io::Error),
}

impl SocketError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SocketError::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SocketError::Closed)
    }

    pub(crate) fn create_failed(errno: Errno) -> Self {
        match errno {
            Errno::ENOMEM | Errno::ENOBUFS => SocketError::OutOfMemory,
            e => SocketError::CreateFailed(io::Error::from(e)),
        }
    }
}

pub(crate) fn would_block(errno: Errno) -> bool {
    errno == Errno::EAGAIN || errno == Errno::EWOULDBLOCK
}

impl From<Errno> for SocketError {
    fn from(errno: Errno) -> Self {
        match errno {
            e if would_block(e) => SocketError::Retry,
            Errno::ECONNREFUSED => SocketError::Refused,
            Errno::ECONNRESET | Errno::EPIPE | Errno::ENOTCONN | Errno::ECONNABORTED => {
                SocketError::Closed
            }
            Errno::ETIMEDOUT => SocketError::Timeout,
            Errno::ENOMEM | Errno::ENOBUFS => SocketError::OutOfMemory,
            e => SocketError::Io(io::Error::from(e)),
        }
    }
}

/// A transfer that stopped early. `partial` holds what was produced before
/// `error` occurred; nothing already transferred is dropped.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct Incomplete<T> {
    pub partial: T,
    #[source]
    pub error: SocketError,
}

impl<T> Incomplete<T> {
    pub fn new(partial: T, error: SocketError) -> Self {
        Self { partial, error }
    }

    pub fn into_parts(self) -> (T, SocketError) {
        (self.partial, self.error)
    }
}
