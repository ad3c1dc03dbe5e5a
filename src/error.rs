use std::{
    io::{self, ErrorKind},
    result,
    sync::Arc,
};

use thiserror::Error;

/// Errors indicating a violation of the wire protocol or of a channel's
/// event protocol.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    /// Received a frame that does not match the `[span, type, args]` shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Received a message whose type code is not allowed by the channel's
    /// current upstream protocol.
    #[error("unexpected message type {ty} on span {span}")]
    UnexpectedType {
        /// The channel the message arrived on.
        span: u64,
        /// The offending type code.
        ty: u64,
    },
}

impl From<&str> for ProtocolError {
    fn from(message: &str) -> Self {
        Self::MalformedFrame(message.to_string())
    }
}

impl From<String> for ProtocolError {
    fn from(message: String) -> Self {
        Self::MalformedFrame(message)
    }
}

/// Misuse of the future and stream primitives.
///
/// These are programming errors: they fail the caller's operation but never
/// corrupt session state.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum StateError {
    /// The promise or stream has already been satisfied or closed.
    #[error("promise already satisfied")]
    PromiseAlreadySatisfied,

    /// The promise was dropped before producing a value.
    #[error("broken promise")]
    BrokenPromise,

    /// The handle has no shared state behind it.
    #[error("no state")]
    NoState,

    /// The future or generator for this state was already retrieved.
    #[error("future already retrieved")]
    FutureAlreadyRetrieved,

    /// The stream is closed and fully drained.
    #[error("stream closed")]
    StreamClosed,
}

/// Errors produced by session operations and delivered through futures and
/// channel streams.
///
/// The variants are cheap to clone: a single transport failure is fanned out
/// to every pending write promise and every live channel, so the underlying
/// I/O errors are reference-counted.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Error occurred during I/O on an established connection.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// Error occurred while trying to establish a connection.
    #[error("connection failed: {source}")]
    Connect {
        /// Underlying OS error, e.g. connection refused.
        #[source]
        source: Arc<io::Error>,
    },

    /// The connection was closed by the peer.
    #[error("connection disconnected")]
    Disconnected {
        /// Underlying I/O error, when available.
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// The session is not in the Connected state.
    #[error("not connected")]
    NotConnected,

    /// A connect is already in flight on this session.
    #[error("connect already started")]
    AlreadyStarted,

    /// The session is already connected to a different endpoint.
    #[error("already connected")]
    AlreadyConnected,

    /// The operation was abandoned by an explicit disconnect.
    #[error("operation aborted")]
    OperationAborted,

    /// MessagePack serialization failed.
    #[error("serialization error: {0}")]
    Encode(#[source] Arc<rmpv::encode::Error>),

    /// MessagePack deserialization failed. Fatal for the session.
    #[error("deserialization error: {0}")]
    Decode(#[source] Arc<rmpv::decode::Error>),

    /// Failed to serialize invocation arguments.
    #[cfg(feature = "serde")]
    #[error("argument serialization error: {0}")]
    Arguments(#[source] Arc<rmpv::ext::Error>),

    /// The wire or event protocol was violated.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A future or stream primitive was misused.
    #[error(transparent)]
    State(#[from] StateError),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::NotConnected => Self::Disconnected {
                source: Some(Arc::new(error)),
            },
            _ => Self::Io(Arc::new(error)),
        }
    }
}

impl From<rmpv::encode::Error> for Error {
    fn from(error: rmpv::encode::Error) -> Self {
        Self::Encode(Arc::new(error))
    }
}

impl From<rmpv::decode::Error> for Error {
    fn from(error: rmpv::decode::Error) -> Self {
        Self::Decode(Arc::new(error))
    }
}

#[cfg(feature = "serde")]
impl From<rmpv::ext::Error> for Error {
    fn from(error: rmpv::ext::Error) -> Self {
        Self::Arguments(Arc::new(error))
    }
}

/// A type alias for `Result` with [`Error`] as the error type.
pub type Result<T> = result::Result<T, Error>;
