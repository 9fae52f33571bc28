//! In-band stream method.
//!
//! Tunnels the byte stream as ordinary protocol messages when no direct or
//! relayed socket is feasible. Data blocks are base64 payloads tagged with
//! a wrapping 16-bit sequence number. The enclosing session already
//! guarantees in-order delivery, so the receiver's sequence check is a
//! correctness backstop, not a reordering mechanism: any gap is fatal and
//! tears the stream down.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::connection::{Collector, Connection};
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::method::{ByteSink, ByteSource, StreamMethod, StreamSession};
use crate::negotiator::NegotiatorConfig;
use crate::stanza::{
    CloseBlock, DataBlock, ErrorCondition, OpenBlock, Payload, PayloadKind, Stanza, StanzaFilter,
};

/// Capability token for the in-band bytestream method.
pub const NAMESPACE: &str = "http://jabber.org/protocol/ibb";

/// The in-band stream method.
pub struct InBandMethod {
    connection: Arc<dyn Connection>,
    config: Arc<NegotiatorConfig>,
}

impl InBandMethod {
    pub fn new(connection: Arc<dyn Connection>, config: Arc<NegotiatorConfig>) -> Self {
        Self { connection, config }
    }
}

#[async_trait]
impl StreamMethod for InBandMethod {
    fn tokens(&self) -> Vec<&'static str> {
        vec![NAMESPACE]
    }

    fn initiation_filter(&self, from: &Jid, sid: &str) -> StanzaFilter {
        StanzaFilter::Session {
            from: from.clone(),
            sid: sid.to_string(),
            kinds: vec![PayloadKind::Open],
        }
    }

    async fn open_outgoing(&self, session: &StreamSession) -> Result<ByteSink> {
        let id = self.connection.next_id();
        let mut collector = self.connection.collect(StanzaFilter::Id(id.clone()));
        self.connection.send(Stanza::new(
            id,
            self.connection.local_jid().clone(),
            session.target.clone(),
            Payload::Open(OpenBlock {
                sid: session.sid.clone(),
                block_size: self.config.block_size,
            }),
        ))?;

        let reply = collector
            .next(self.config.response_timeout)
            .await
            .ok_or(Error::ReplyTimeout(
                "in-band open",
                self.config.response_timeout,
            ))?;
        match reply.payload {
            Payload::Ack => {}
            Payload::Error(e) => return Err(Error::Remote(e)),
            other => {
                return Err(Error::UnexpectedReply(format!(
                    "in-band open answered with {:?}",
                    other.kind()
                )))
            }
        }
        tracing::debug!(sid = %session.sid, block_size = self.config.block_size, "in-band stream opened");

        Ok(Box::new(InBandSink {
            connection: Arc::clone(&self.connection),
            local: self.connection.local_jid().clone(),
            to: session.target.clone(),
            sid: session.sid.clone(),
            block_size: self.config.block_size as usize,
            buf: BytesMut::new(),
            seq: 0,
            closed: false,
        }))
    }

    async fn open_incoming(&self, initiation: Stanza) -> Result<ByteSource> {
        let open = match &initiation.payload {
            Payload::Open(open) => open.clone(),
            other => {
                return Err(Error::UnexpectedReply(format!(
                    "expected an in-band open, got {:?}",
                    other.kind()
                )))
            }
        };
        if open.block_size == 0 {
            let _ = self.connection.send(
                initiation.error_reply(ErrorCondition::ResourceConstraint, "zero block size"),
            );
            return Err(Error::UnexpectedReply(
                "peer declared a zero block size".to_string(),
            ));
        }

        // register for data before acknowledging the open, so the first
        // block cannot be lost to a race
        let collector = self.connection.collect(StanzaFilter::Session {
            from: initiation.from.clone(),
            sid: open.sid.clone(),
            kinds: vec![PayloadKind::Data, PayloadKind::Close],
        });
        self.connection.send(initiation.reply(Payload::Ack))?;
        tracing::debug!(sid = %open.sid, block_size = open.block_size, "in-band stream accepted");

        Ok(Box::new(InBandSource {
            connection: Arc::clone(&self.connection),
            collector,
            buf: BytesMut::new(),
            expected_seq: 0,
            eof: false,
        }))
    }
}

/// Write end of an in-band stream.
///
/// Buffers up to one block, sending a data stanza whenever the block fills;
/// `shutdown` flushes the remainder and sends the close stanza.
struct InBandSink {
    connection: Arc<dyn Connection>,
    local: Jid,
    to: Jid,
    sid: String,
    block_size: usize,
    buf: BytesMut,
    seq: u16,
    closed: bool,
}

impl InBandSink {
    fn flush_block(&mut self) -> Result<()> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;

        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split();
        let stanza = Stanza::new(
            self.connection.next_id(),
            self.local.clone(),
            self.to.clone(),
            Payload::Data(DataBlock {
                sid: self.sid.clone(),
                seq: self.seq,
                data: STANDARD.encode(&chunk),
            }),
        );
        self.connection.send(stanza)?;
        // wraps at the 16-bit boundary back to zero
        self.seq = self.seq.wrapping_add(1);
        Ok(())
    }
}

fn broken_pipe(e: Error) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, e)
}

impl AsyncWrite for InBandSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream is closed",
            )));
        }
        let room = this.block_size - this.buf.len();
        let n = room.min(data.len());
        this.buf.extend_from_slice(&data[..n]);
        if this.buf.len() >= this.block_size {
            if let Err(e) = this.flush_block() {
                return Poll::Ready(Err(broken_pipe(e)));
            }
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream is closed",
            )));
        }
        Poll::Ready(this.flush_block().map_err(broken_pipe))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        if let Err(e) = this.flush_block() {
            return Poll::Ready(Err(broken_pipe(e)));
        }
        let close = Stanza::new(
            this.connection.next_id(),
            this.local.clone(),
            this.to.clone(),
            Payload::Close(CloseBlock {
                sid: this.sid.clone(),
            }),
        );
        if let Err(e) = this.connection.send(close) {
            return Poll::Ready(Err(broken_pipe(e)));
        }
        this.closed = true;
        Poll::Ready(Ok(()))
    }
}

/// Read end of an in-band stream.
///
/// Decodes collector-fed data blocks into an internal buffer. Sequence
/// numbers must be strictly contiguous mod 65536; a gap sends a
/// cancellation error to the peer and fails the stream.
struct InBandSource {
    connection: Arc<dyn Connection>,
    collector: Collector,
    buf: BytesMut,
    expected_seq: u16,
    eof: bool,
}

impl InBandSource {
    fn process(&mut self, stanza: Stanza) -> io::Result<()> {
        match &stanza.payload {
            Payload::Data(block) => {
                if block.seq != self.expected_seq {
                    let _ = self.connection.send(stanza.error_reply(
                        ErrorCondition::UnexpectedRequest,
                        "data block out of sequence",
                    ));
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "data block out of sequence: expected {}, got {}",
                            self.expected_seq, block.seq
                        ),
                    ));
                }
                let decoded = match block.decoded() {
                    Some(decoded) => decoded,
                    None => {
                        let _ = self.connection.send(stanza.error_reply(
                            ErrorCondition::BadRequest,
                            "invalid data block encoding",
                        ));
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid data block encoding",
                        ));
                    }
                };
                self.expected_seq = self.expected_seq.wrapping_add(1);
                self.buf.extend_from_slice(&decoded);
                let _ = self.connection.send(stanza.reply(Payload::Ack));
                Ok(())
            }
            Payload::Close(_) => {
                // confirm the close, then report end of stream
                let _ = self.connection.send(stanza.reply(Payload::Ack));
                self.eof = true;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl AsyncRead for InBandSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.buf.is_empty() {
                let n = out.remaining().min(this.buf.len());
                out.put_slice(&this.buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match this.collector.poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "connection closed before the stream was closed",
                    )))
                }
                Poll::Ready(Some(stanza)) => {
                    if let Err(e) = this.process(stanza) {
                        return Poll::Ready(Err(e));
                    }
                }
            }
        }
    }
}
