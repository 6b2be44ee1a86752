use std::io;

use thiserror::Error;

use super::frame::{FrameError, Reply};

/// Error from talking to the server through the pool.
#[derive(Error, Debug)]
pub enum Error {
    /// The server sent bytes that are not a valid reply; the connection is closed.
    #[error("Frame error - {0}")]
    Frame(#[from] FrameError),

    /// The transport failed; the connection is closed.
    #[error("I/O error - {0}")]
    Io(#[from] io::Error),

    /// Every pooled connection has a request in flight.
    #[error("No idle connection available")]
    Exhausted,

    /// No connection became idle before the acquire timeout elapsed.
    #[error("Timed out waiting for an idle connection")]
    AcquireTimeout,

    /// The pool was closed.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// The connection was closed, either explicitly or after a failure.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The connection already has a request in flight.
    #[error("Connection is busy")]
    ConnectionBusy,

    /// No reply arrived before the request timeout elapsed; the connection is closed.
    #[error("Request timed out")]
    Timeout,

    /// The server answered with an error reply.
    #[error("Command failed - {0}")]
    Command(String),

    /// The reply does not have the shape the command expects.
    #[error("Unexpected reply - {0:?}")]
    UnexpectedReply(Reply),
}

impl Error {
    /// Returns `true` when the pool and its connections stay usable and the caller
    /// may simply retry or move on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Exhausted | Error::AcquireTimeout | Error::Command(_) | Error::UnexpectedReply(_)
        )
    }
}
