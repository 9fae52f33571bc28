//! In-process linked endpoint pair.
//!
//! [`linked_pair`] wires two [`Connection`] implementations directly to
//! each other: everything one endpoint sends is routed to the other
//! endpoint's collectors. This is the loopback harness used by the crate's
//! own tests; it is also handy for exercising the negotiation machinery
//! without a real session layer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::{Collector, Connection, ServiceRecord};
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::stanza::{Stanza, StanzaFilter};

#[derive(Default)]
struct Registry {
    next_key: u64,
    entries: Vec<(u64, StanzaFilter, mpsc::UnboundedSender<Stanza>)>,
}

/// One side of an in-process pair.
pub struct PairEndpoint {
    jid: Jid,
    peer_tx: mpsc::UnboundedSender<Stanza>,
    registry: Arc<Mutex<Registry>>,
    features: Mutex<HashMap<Jid, HashSet<String>>>,
    items: Mutex<HashMap<Jid, Vec<ServiceRecord>>>,
    id_counter: AtomicU64,
}

impl PairEndpoint {
    /// Configures the feature set a discovery query against `target` will
    /// return from this endpoint. Unconfigured targets report no features.
    pub fn set_features(&self, target: Jid, features: impl IntoIterator<Item = String>) {
        self.features
            .lock()
            .unwrap()
            .insert(target, features.into_iter().collect());
    }

    /// Configures the service items a discovery query against `target`
    /// will return from this endpoint.
    pub fn set_items(&self, target: Jid, records: Vec<ServiceRecord>) {
        self.items.lock().unwrap().insert(target, records);
    }
}

#[async_trait]
impl Connection for PairEndpoint {
    fn local_jid(&self) -> &Jid {
        &self.jid
    }

    fn send(&self, stanza: Stanza) -> Result<()> {
        self.peer_tx
            .send(stanza)
            .map_err(|_| Error::ConnectionClosed)
    }

    fn collect(&self, filter: StanzaFilter) -> Collector {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = {
            let mut registry = self.registry.lock().unwrap();
            let key = registry.next_key;
            registry.next_key += 1;
            registry.entries.push((key, filter, tx));
            key
        };
        let registry = Arc::clone(&self.registry);
        Collector::new(
            rx,
            Box::new(move || {
                registry
                    .lock()
                    .unwrap()
                    .entries
                    .retain(|(k, _, _)| *k != key);
            }),
        )
    }

    async fn discover_features(&self, target: &Jid) -> Result<HashSet<String>> {
        Ok(self
            .features
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or_default())
    }

    async fn discover_items(&self, target: &Jid) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or_default())
    }

    fn next_id(&self) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("iq-{}-{}", self.jid.node(), n)
    }
}

/// Creates two endpoints routed directly at each other.
///
/// Each endpoint runs a dispatch task that delivers inbound stanzas to
/// every matching collector; unmatched stanzas are dropped with a trace
/// log, mirroring a session layer discarding replies nobody waits for.
pub fn linked_pair(a: Jid, b: Jid) -> (Arc<PairEndpoint>, Arc<PairEndpoint>) {
    let (a_inbox_tx, a_inbox_rx) = mpsc::unbounded_channel();
    let (b_inbox_tx, b_inbox_rx) = mpsc::unbounded_channel();

    let endpoint_a = Arc::new(PairEndpoint {
        jid: a,
        peer_tx: b_inbox_tx,
        registry: Arc::new(Mutex::new(Registry::default())),
        features: Mutex::new(HashMap::new()),
        items: Mutex::new(HashMap::new()),
        id_counter: AtomicU64::new(0),
    });
    let endpoint_b = Arc::new(PairEndpoint {
        jid: b,
        peer_tx: a_inbox_tx,
        registry: Arc::new(Mutex::new(Registry::default())),
        features: Mutex::new(HashMap::new()),
        items: Mutex::new(HashMap::new()),
        id_counter: AtomicU64::new(0),
    });

    spawn_dispatch(a_inbox_rx, Arc::clone(&endpoint_a.registry));
    spawn_dispatch(b_inbox_rx, Arc::clone(&endpoint_b.registry));

    (endpoint_a, endpoint_b)
}

fn spawn_dispatch(mut inbox: mpsc::UnboundedReceiver<Stanza>, registry: Arc<Mutex<Registry>>) {
    tokio::spawn(async move {
        while let Some(stanza) = inbox.recv().await {
            let mut delivered = false;
            let mut reg = registry.lock().unwrap();
            reg.entries.retain(|(_, filter, tx)| {
                if filter.matches(&stanza) {
                    if tx.send(stanza.clone()).is_ok() {
                        delivered = true;
                        true
                    } else {
                        // collector receiver gone, drop the registration
                        false
                    }
                } else {
                    !tx.is_closed()
                }
            });
            drop(reg);
            if !delivered {
                tracing::trace!(id = %stanza.id, kind = ?stanza.payload.kind(), "dropped unmatched stanza");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{Payload, PayloadKind};
    use std::time::Duration;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn pair() -> (Arc<PairEndpoint>, Arc<PairEndpoint>) {
        linked_pair(jid("alice@example.org/a"), jid("bob@example.org/b"))
    }

    #[tokio::test]
    async fn send_routes_to_matching_collector_on_peer() {
        let (a, b) = pair();
        let mut collector = b.collect(StanzaFilter::Id("iq-alice-0".to_string()));

        let id = a.next_id();
        a.send(Stanza::new(
            id,
            a.local_jid().clone(),
            b.local_jid().clone(),
            Payload::Ack,
        ))
        .unwrap();

        let stanza = collector.next(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stanza.from, jid("alice@example.org/a"));
    }

    #[tokio::test]
    async fn non_matching_stanza_is_not_delivered() {
        let (a, b) = pair();
        let mut collector = b.collect(StanzaFilter::Kinds(vec![PayloadKind::Open]));

        a.send(Stanza::new(
            a.next_id(),
            a.local_jid().clone(),
            b.local_jid().clone(),
            Payload::Ack,
        ))
        .unwrap();

        assert!(collector.next(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn cancelled_collector_stops_receiving() {
        let (a, b) = pair();
        let mut collector = b.collect(StanzaFilter::Kinds(vec![PayloadKind::Ack]));
        collector.cancel();

        a.send(Stanza::new(
            a.next_id(),
            a.local_jid().clone(),
            b.local_jid().clone(),
            Payload::Ack,
        ))
        .unwrap();

        assert!(collector.next(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn both_of_two_matching_collectors_receive() {
        let (a, b) = pair();
        let mut first = b.collect(StanzaFilter::Kinds(vec![PayloadKind::Ack]));
        let mut second = b.collect(StanzaFilter::Kinds(vec![PayloadKind::Ack]));

        a.send(Stanza::new(
            a.next_id(),
            a.local_jid().clone(),
            b.local_jid().clone(),
            Payload::Ack,
        ))
        .unwrap();

        assert!(first.next(Duration::from_secs(1)).await.is_some());
        assert!(second.next(Duration::from_secs(1)).await.is_some());
    }

    #[tokio::test]
    async fn discovery_returns_configured_values() {
        let (a, b) = pair();
        let target = b.local_jid().clone();
        a.set_features(target.clone(), ["urn:example:feature".to_string()]);

        let features = a.discover_features(&target).await.unwrap();
        assert!(features.contains("urn:example:feature"));

        // unconfigured target reports nothing
        let none = a.discover_features(&jid("nobody@example.org")).await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn service_jid_is_the_local_domain() {
        let endpoint = PairEndpoint {
            jid: jid("alice@example.org/a"),
            peer_tx: mpsc::unbounded_channel().0,
            registry: Arc::new(Mutex::new(Registry::default())),
            features: Mutex::new(HashMap::new()),
            items: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(0),
        };
        assert_eq!(endpoint.service_jid(), jid("example.org"));
    }
}
