//! Application-facing transfer coordination.
//!
//! The coordinator owns the per-connection negotiator and a dispatch task
//! that turns inbound offer stanzas into typed [`OfferRequest`] events on
//! listener channels. Listeners are channels rather than callback objects;
//! dropping the receiver unregisters it.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::Result;
use crate::jid::Jid;
use crate::negotiator::{NegotiatorConfig, TransferNegotiator};
use crate::stanza::{Payload, PayloadKind, Stanza, StanzaFilter, TransferOffer};
use crate::transfer::{IncomingTransfer, OutgoingTransfer};

/// An inbound transfer offer awaiting the application's decision.
#[derive(Clone)]
pub struct OfferRequest {
    offer: Stanza,
    negotiator: Arc<TransferNegotiator>,
}

impl OfferRequest {
    fn details(&self) -> &TransferOffer {
        match &self.offer.payload {
            Payload::Offer(details) => details,
            // the dispatch task only constructs requests from offers
            other => unreachable!("offer request built from {:?}", other.kind()),
        }
    }

    pub fn peer(&self) -> &Jid {
        &self.offer.from
    }

    pub fn stream_id(&self) -> &str {
        &self.details().sid
    }

    pub fn file_name(&self) -> &str {
        &self.details().file_name
    }

    pub fn file_size(&self) -> u64 {
        self.details().file_size
    }

    pub fn description(&self) -> &str {
        &self.details().description
    }

    /// The capability tokens the peer offered, most preferred first.
    pub fn methods(&self) -> &[String] {
        &self.details().methods
    }

    /// Accepts the offer, producing the transfer object that negotiates
    /// and receives the stream.
    pub fn accept(self) -> IncomingTransfer {
        IncomingTransfer::new(self.offer, self.negotiator)
    }

    /// Declines the offer; the peer sees an explicit refusal.
    pub fn reject(self) -> Result<()> {
        self.negotiator.reject_offer(&self.offer)
    }
}

/// Receives inbound transfer offers and creates outgoing transfers.
///
/// One per connection; owns the negotiator (and through it the relay
/// listener), so dropping or shutting down the coordinator releases every
/// resource the subsystem holds on that connection.
pub struct TransferCoordinator {
    negotiator: Arc<TransferNegotiator>,
    listeners: Arc<StdMutex<Vec<mpsc::UnboundedSender<OfferRequest>>>>,
    dispatch: JoinHandle<()>,
}

impl TransferCoordinator {
    pub fn new(connection: Arc<dyn Connection>, config: NegotiatorConfig) -> Self {
        let negotiator = Arc::new(TransferNegotiator::new(Arc::clone(&connection), config));
        let listeners: Arc<StdMutex<Vec<mpsc::UnboundedSender<OfferRequest>>>> =
            Arc::new(StdMutex::new(Vec::new()));

        let mut collector = connection.collect(StanzaFilter::Kinds(vec![PayloadKind::Offer]));
        let dispatch = {
            let negotiator = Arc::clone(&negotiator);
            let listeners = Arc::clone(&listeners);
            tokio::spawn(async move {
                while let Some(offer) = collector.recv().await {
                    tracing::debug!(peer = %offer.from, sid = ?offer.payload.sid(), "transfer offer received");
                    let request = OfferRequest {
                        offer,
                        negotiator: Arc::clone(&negotiator),
                    };
                    let mut subscribers = listeners.lock().unwrap();
                    subscribers.retain(|tx| tx.send(request.clone()).is_ok());
                    if subscribers.is_empty() {
                        tracing::debug!("transfer offer dropped, no listeners registered");
                    }
                }
            })
        };

        Self {
            negotiator,
            listeners,
            dispatch,
        }
    }

    /// Registers a listener for inbound offers. Dropping the returned
    /// receiver unregisters it.
    pub fn add_listener(&self) -> mpsc::UnboundedReceiver<OfferRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    /// Creates an outgoing transfer towards `peer` with a fresh stream id.
    pub fn create_outgoing(&self, peer: Jid) -> OutgoingTransfer {
        let sid = self.negotiator.next_stream_id();
        OutgoingTransfer::new(peer, sid, Arc::clone(&self.negotiator))
    }

    pub fn negotiator(&self) -> &Arc<TransferNegotiator> {
        &self.negotiator
    }

    /// Stops offer dispatch and releases the negotiator's resources,
    /// including the relay listener.
    pub fn shutdown(&self) {
        self.dispatch.abort();
        self.negotiator.shutdown();
    }
}

impl Drop for TransferCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
