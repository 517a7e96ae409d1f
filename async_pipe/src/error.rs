//! Error taxonomy shared by the runtime, the readiness monitor and the connections.

use std::io;

use crate::scheduler::Direction;

/// Errors surfaced by pipe connections and the runtime driving them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection was closed locally before or during the operation.
    #[error("connection is closed")]
    ClosedConnection,

    /// The peer failed or vanished in the middle of an operation.
    #[error("broken channel: {0}")]
    BrokenChannel(#[source] io::Error),

    /// The peer closed cleanly at a message boundary; no more data will arrive.
    #[error("end of channel")]
    EndOfChannel,

    /// A buffer, offset or size argument was rejected before any I/O happened.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The incoming message does not fit in the destination buffer. The message is discarded.
    #[error("buffer too small: message needs {needed} bytes, {available} available")]
    BufferTooSmall { needed: usize, available: usize },

    /// The incoming message exceeds the caller's length limit. The message is discarded.
    #[error("bad message length: {length} exceeds limit of {max}")]
    MessageTooLong { length: usize, max: usize },

    /// The operation is not available on this end of a simplex pipe.
    #[error("{0}")]
    Unsupported(&'static str),

    /// A readiness direction was registered twice for the same endpoint.
    #[error("{0} readiness is already registered")]
    AlreadyRegistered(Direction),

    /// The task producing the value was aborted.
    #[error("task was cancelled")]
    Cancelled,

    /// No runtime is active on the calling thread.
    #[error("no async_pipe runtime is active on this thread")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("payload codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(io::Error),
}

impl Error {
    /// Classifies an I/O error coming from the endpoint.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero => Error::BrokenChannel(err),
            _ => Error::Io(err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
