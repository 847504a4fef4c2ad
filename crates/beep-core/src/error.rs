//! Error types for the BEEP engine

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, BeepError>;

/// Errors surfaced by engine operations
#[derive(Debug, Error)]
pub enum BeepError {
    /// Ordering or format violation on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport failure during connect, accept or I/O
    #[error("connection error: {0}")]
    Connection(String),

    /// Connect or greeting exchange did not finish in time
    #[error("connection timed out")]
    ConnectionTimeout,

    /// An accept hook or the profile mask rejected the peer
    #[error("connection filtered: {0}")]
    ConnectionFiltered(String),

    #[error("socket creation failed: {0}")]
    SocketCreation(String),

    #[error("bind failed: {0}")]
    Bind(String),

    #[error("allocation failed: {0}")]
    MemoryFail(String),

    /// A bounded wait expired
    #[error("operation timed out")]
    Timeout,

    #[error("profile not registered: {0}")]
    UnknownProfile(String),

    /// The remote peer answered a start/close request with `<error>`
    #[error("channel refused ({code}): {message}")]
    ChannelRefused { code: u32, message: String },

    #[error("channel {0} not found")]
    ChannelNotFound(u32),

    #[error("connection is not connected")]
    NotConnected,

    #[error("reader or worker pool is stopped")]
    Stopped,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl BeepError {
    /// Status code recorded on a connection when this error tears it down.
    pub fn status(&self) -> Status {
        match self {
            BeepError::Protocol(_) => Status::ProtocolError,
            BeepError::Connection(_) | BeepError::Io(_) | BeepError::NotConnected => {
                Status::ConnectionError
            }
            BeepError::ConnectionTimeout => Status::ConnectionTimeoutError,
            BeepError::ConnectionFiltered(_) => Status::ConnectionFiltered,
            BeepError::SocketCreation(_) => Status::SocketCreationError,
            BeepError::Bind(_) => Status::BindError,
            BeepError::MemoryFail(_) => Status::MemoryFail,
            _ => Status::Error,
        }
    }
}

/// Per-connection status codes.
///
/// A connection keeps a FIFO of `(Status, message)` records; the reader
/// pushes one every time it tears a connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Error,
    ProtocolError,
    ConnectionError,
    ConnectionTimeoutError,
    ConnectionFiltered,
    /// Peer closed the socket without a BEEP close exchange
    UnnotifiedConnectionClose,
    MemoryFail,
    SocketCreationError,
    BindError,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Error => "error",
            Status::ProtocolError => "protocol error",
            Status::ConnectionError => "connection error",
            Status::ConnectionTimeoutError => "connection timeout",
            Status::ConnectionFiltered => "connection filtered",
            Status::UnnotifiedConnectionClose => "unnotified connection close",
            Status::MemoryFail => "memory failure",
            Status::SocketCreationError => "socket creation error",
            Status::BindError => "bind error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures while turning bytes into frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("header line exceeds {0} octets without CRLF")]
    HeaderTooLong(usize),

    #[error("header line not terminated by CRLF")]
    MissingCrlf,

    #[error("unknown frame type '{0}'")]
    UnknownType(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("{field} value {value} out of range")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("frame trailer is not END")]
    BadTrailer,
}

impl From<DecodeError> for BeepError {
    fn from(e: DecodeError) -> Self {
        BeepError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(BeepError::Timeout.to_string(), "operation timed out");
        assert_eq!(
            BeepError::ChannelRefused { code: 550, message: "no".into() }.to_string(),
            "channel refused (550): no"
        );
        assert_eq!(
            DecodeError::UnknownType("FOO".into()).to_string(),
            "unknown frame type 'FOO'"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(BeepError::Protocol("x".into()).status(), Status::ProtocolError);
        assert_eq!(BeepError::ConnectionTimeout.status(), Status::ConnectionTimeoutError);
        assert_eq!(BeepError::Bind("x".into()).status(), Status::BindError);
        assert_eq!(BeepError::Timeout.status(), Status::Error);
    }

    #[test]
    fn test_decode_error_converts_to_protocol() {
        let e: BeepError = DecodeError::BadTrailer.into();
        assert!(matches!(e, BeepError::Protocol(_)));
    }

    #[test]
    fn test_io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let e: BeepError = io.into();
        assert_eq!(e.status(), Status::ConnectionError);
    }
}
