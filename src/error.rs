//! Error types for the file-transfer negotiation subsystem.

use std::time::Duration;

use thiserror::Error;

use crate::stanza::StanzaError;

/// Classifies why a transfer ended in the error state.
///
/// Attached to a transfer together with the causing [`Error`] when the
/// transfer transitions to [`Status::Error`](crate::transfer::Status::Error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer did not find any of the offered stream methods acceptable.
    NotAcceptable,
    /// The local file is missing or unreadable, or the destination is not
    /// writable.
    BadFile,
    /// The peer never replied within the negotiation timeout.
    NoResponse,
    /// The socket or transport dropped mid-copy (byte count mismatch at the
    /// end of the copy loop).
    Connection,
    /// Any other failure of the negotiated stream.
    Stream,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ErrorKind::NotAcceptable => {
                "the peer did not find any of the offered stream methods acceptable"
            }
            ErrorKind::BadFile => "the file to transfer does not exist or could not be accessed",
            ErrorKind::NoResponse => "the peer did not respond within the negotiation timeout",
            ErrorKind::Connection => "the transfer socket failed before all bytes were moved",
            ErrorKind::Stream => "an error occurred while sending or receiving the file",
        };
        f.write_str(msg)
    }
}

/// Main error type for negotiation and stream operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("no acceptable transfer method")]
    NoAcceptableMethod,

    #[error("peer returned an error: {0}")]
    Remote(StanzaError),

    #[error("no reply to {0} within {1:?}")]
    ReplyTimeout(&'static str, Duration),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("could not establish a socket with any offered stream host")]
    NoUsableHost,

    #[error("SOCKS5 handshake failed: {0}")]
    Socks(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("stream closed after {written} of {expected} bytes")]
    Truncated { written: u64, expected: u64 },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure already recorded on a transfer, shared with its
    /// observers through [`Transfer::cause`](crate::transfer::Transfer::cause).
    #[error("{0}")]
    Shared(std::sync::Arc<Error>),
}

impl Error {
    /// Maps a negotiation-layer failure onto the transfer error taxonomy.
    ///
    /// A remote `forbidden` reply is an explicit refusal and is handled by
    /// the caller before this classifier applies.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoAcceptableMethod => ErrorKind::NotAcceptable,
            Error::Remote(e) if e.condition.is_rejection() => ErrorKind::NotAcceptable,
            Error::ReplyTimeout(..) => ErrorKind::NoResponse,
            Error::Truncated { .. } => ErrorKind::Connection,
            Error::Shared(inner) => inner.kind(),
            _ => ErrorKind::Stream,
        }
    }
}

/// Result type alias for negotiation and stream operations.
pub type Result<T> = std::result::Result<T, Error>;
