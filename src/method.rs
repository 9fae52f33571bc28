//! The stream-method contract.
//!
//! A stream method knows how to negotiate and produce a byte stream for one
//! transport technique. The crate ships exactly two:
//! [`Socks5Method`](crate::socks5::Socks5Method) and
//! [`InBandMethod`](crate::inband::InBandMethod), optionally composed by
//! [`FallbackMethod`](crate::fallback::FallbackMethod).

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::jid::Jid;
use crate::stanza::{Stanza, StanzaFilter};

/// The write end of a negotiated stream, held by the sender.
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// The read end of a negotiated stream, held by the receiver.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Identifies one stream session across both roles.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub sid: String,
    /// The side that offered the transfer.
    pub initiator: Jid,
    /// The side that accepted it.
    pub target: Jid,
}

impl StreamSession {
    pub fn new(sid: impl Into<String>, initiator: Jid, target: Jid) -> Self {
        Self {
            sid: sid.into(),
            initiator,
            target,
        }
    }
}

/// One transport technique's negotiation strategy.
#[async_trait]
pub trait StreamMethod: Send + Sync {
    /// The capability token(s) this method answers for, in preference
    /// order. Single methods return one token; the fallback composite
    /// returns both.
    fn tokens(&self) -> Vec<&'static str>;

    /// The filter matching this method's initiation stanza from the given
    /// peer for the given session. The accepting side registers this before
    /// confirming the offer, so the initiation cannot be lost to a race.
    fn initiation_filter(&self, from: &Jid, sid: &str) -> StanzaFilter;

    /// Initiator role: negotiates with the peer and opens the write end of
    /// the stream.
    async fn open_outgoing(&self, session: &StreamSession) -> Result<ByteSink>;

    /// Target role: consumes the peer's initiation stanza (matched by
    /// [`initiation_filter`](Self::initiation_filter)) and opens the read
    /// end of the stream.
    async fn open_incoming(&self, initiation: Stanza) -> Result<ByteSource>;
}
