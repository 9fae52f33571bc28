//! Transfer negotiation coordinator.
//!
//! One negotiator exists per connection, created lazily on first use and
//! torn down with it. It mediates capability discovery and method
//! selection: the offer carries the advertised capability tokens in
//! preference order, the peer's reply names the chosen token(s), and the
//! single/both/none outcome decides between a concrete stream method, the
//! fallback composite, or a failure.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::fallback::FallbackMethod;
use crate::inband::{self, InBandMethod};
use crate::jid::Jid;
use crate::method::{ByteSource, StreamMethod};
use crate::relay::RelayCoordinator;
use crate::socks5::{self, Socks5Method};
use crate::stanza::{
    ErrorCondition, MethodSelection, Payload, Stanza, StanzaFilter, TransferOffer,
};

/// Prefix of generated stream session identifiers.
const SESSION_ID_PREFIX: &str = "ft_";

/// Per-connection negotiation settings.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Restricts every offer to the in-band method. Useful on networks
    /// without SOCKS5 relay support; the socket token then never appears
    /// in an offer and is ignored in replies.
    pub ibb_only: bool,
    /// How long outbound negotiation round trips wait for a reply.
    pub response_timeout: Duration,
    /// Payload bytes per in-band data block.
    pub block_size: u16,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ibb_only: false,
            response_timeout: Duration::from_secs(60),
            block_size: 4096,
        }
    }
}

/// Per-connection singleton mediating stream-method negotiation.
///
/// Shared by all transfers on the connection; owns both stream methods and
/// the relay coordinator backing the socket method.
pub struct TransferNegotiator {
    connection: Arc<dyn Connection>,
    config: Arc<NegotiatorConfig>,
    socks5: Arc<Socks5Method>,
    inband: Arc<InBandMethod>,
    relay: Arc<RelayCoordinator>,
}

impl TransferNegotiator {
    pub fn new(connection: Arc<dyn Connection>, config: NegotiatorConfig) -> Self {
        let config = Arc::new(config);
        let relay = RelayCoordinator::new();
        let socks5 = Arc::new(Socks5Method::new(
            Arc::clone(&connection),
            Arc::clone(&relay),
            Arc::clone(&config),
        ));
        let inband = Arc::new(InBandMethod::new(
            Arc::clone(&connection),
            Arc::clone(&config),
        ));
        Self {
            connection,
            config,
            socks5,
            inband,
            relay,
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// The capability tokens this endpoint advertises, most preferred
    /// first. The embedding layer registers these as discovery features.
    pub fn advertised_tokens(&self) -> Vec<&'static str> {
        if self.config.ibb_only {
            vec![inband::NAMESPACE]
        } else {
            vec![socks5::NAMESPACE, inband::NAMESPACE]
        }
    }

    /// Produces a probabilistically unique stream session identifier.
    ///
    /// Uniqueness per initiator for the connection lifetime is the
    /// caller's invariant; ids are stored and compared opaquely.
    pub fn next_stream_id(&self) -> String {
        let n: i64 = rand::thread_rng().gen();
        format!("{}{}", SESSION_ID_PREFIX, n.unsigned_abs())
    }

    /// Maps the token set a peer advertised or selected onto a stream
    /// method: both tokens compose the fallback, one picks that method,
    /// none is a failure.
    fn method_for(&self, tokens: &[String]) -> Result<Arc<dyn StreamMethod>> {
        let socket = !self.config.ibb_only && tokens.iter().any(|t| t == socks5::NAMESPACE);
        let in_band = tokens.iter().any(|t| t == inband::NAMESPACE);

        match (socket, in_band) {
            (true, true) => Ok(Arc::new(FallbackMethod::new(
                Arc::clone(&self.socks5) as Arc<dyn StreamMethod>,
                Arc::clone(&self.inband) as Arc<dyn StreamMethod>,
            ))),
            (true, false) => Ok(Arc::clone(&self.socks5) as Arc<dyn StreamMethod>),
            (false, true) => Ok(Arc::clone(&self.inband) as Arc<dyn StreamMethod>),
            (false, false) => Err(Error::NoAcceptableMethod),
        }
    }

    /// Offers a transfer to `peer` and waits up to `timeout` for its
    /// choice of stream method.
    ///
    /// Returns `Ok(None)` when the peer never replies; that is the
    /// "no response" outcome, distinguished from a negotiation error.
    pub async fn negotiate_outgoing(
        &self,
        peer: &Jid,
        sid: &str,
        file_name: &str,
        file_size: u64,
        description: &str,
        timeout: Duration,
    ) -> Result<Option<Arc<dyn StreamMethod>>> {
        // capability pre-check: an entity that advertises features but
        // none of ours cannot answer the offer usefully
        let features = self
            .connection
            .discover_features(peer)
            .await
            .unwrap_or_default();
        if !features.is_empty()
            && !self
                .advertised_tokens()
                .iter()
                .any(|t| features.contains(*t))
        {
            return Err(Error::NoAcceptableMethod);
        }

        let id = self.connection.next_id();
        let mut collector = self.connection.collect(StanzaFilter::Id(id.clone()));
        self.connection.send(Stanza::new(
            id,
            self.connection.local_jid().clone(),
            peer.clone(),
            Payload::Offer(TransferOffer {
                sid: sid.to_string(),
                file_name: file_name.to_string(),
                file_size,
                description: description.to_string(),
                methods: self
                    .advertised_tokens()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            }),
        ))?;
        tracing::debug!(%peer, sid, file_name, file_size, "transfer offered");

        let reply = match collector.next(timeout).await {
            Some(reply) => reply,
            None => {
                tracing::debug!(%peer, sid, "no reply to transfer offer");
                return Ok(None);
            }
        };

        match reply.payload {
            Payload::OfferAccept(selection) => {
                let method = self.method_for(&selection.methods)?;
                tracing::debug!(%peer, sid, tokens = ?method.tokens(), "peer accepted transfer");
                Ok(Some(method))
            }
            Payload::Error(e) => Err(Error::Remote(e)),
            other => Err(Error::UnexpectedReply(format!(
                "transfer offer answered with {:?}",
                other.kind()
            ))),
        }
    }

    /// Inbound mirror of method selection: parses an incoming offer's
    /// advertised tokens and picks via the same single/both/none logic.
    ///
    /// On the none-acceptable path a rejection is sent to the offering
    /// peer before the local failure is raised, so its collector does not
    /// run into its timeout.
    pub fn select_method(&self, offer: &Stanza) -> Result<Arc<dyn StreamMethod>> {
        let details = offer_details(offer)?;
        match self.method_for(&details.methods) {
            Ok(method) => Ok(method),
            Err(e) => {
                let _ = self.connection.send(offer.error_reply(
                    ErrorCondition::BadRequest,
                    "no acceptable transfer method",
                ));
                tracing::debug!(peer = %offer.from, sid = %details.sid, "rejected offer with no usable method");
                Err(e)
            }
        }
    }

    /// Declines an incoming offer on behalf of the application.
    pub fn reject_offer(&self, offer: &Stanza) -> Result<()> {
        self.connection
            .send(offer.error_reply(ErrorCondition::Forbidden, "offer declined"))
    }

    /// Accepting-side orchestration: confirms the offer with the chosen
    /// method's token(s), waits once for the matching initiation and hands
    /// it to the method.
    pub async fn initiate_incoming(
        &self,
        method: &Arc<dyn StreamMethod>,
        offer: &Stanza,
    ) -> Result<ByteSource> {
        let details = offer_details(offer)?;

        // register before confirming, so the initiation cannot be lost
        let mut collector = self
            .connection
            .collect(method.initiation_filter(&offer.from, &details.sid));
        self.connection
            .send(offer.reply(Payload::OfferAccept(MethodSelection {
                sid: details.sid.clone(),
                methods: method.tokens().into_iter().map(str::to_string).collect(),
            })))?;

        let initiation = collector
            .next(self.config.response_timeout)
            .await
            .ok_or(Error::ReplyTimeout(
                "stream initiation",
                self.config.response_timeout,
            ))?;
        method.open_incoming(initiation).await
    }

    /// Releases resources owned by this negotiator, in particular the
    /// relay listener of the socket method.
    pub fn shutdown(&self) {
        self.relay.shutdown();
    }
}

fn offer_details(offer: &Stanza) -> Result<&TransferOffer> {
    match &offer.payload {
        Payload::Offer(details) => Ok(details),
        other => Err(Error::UnexpectedReply(format!(
            "expected a transfer offer, got {:?}",
            other.kind()
        ))),
    }
}
