//! The narrow interface consumed from the surrounding connection layer.
//!
//! The negotiation core never parses XML or touches the network session; it
//! sends [`Stanza`] values, collects replies matching a [`StanzaFilter`]
//! with a timeout, and issues service-discovery queries. Any session layer
//! that can provide these four operations can host the subsystem.

use std::collections::HashSet;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::jid::Jid;
use crate::stanza::{Stanza, StanzaFilter};

/// One entry returned by a service-discovery items query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub jid: Jid,
    /// Service category, e.g. `proxy`.
    pub category: String,
    /// Service type within the category, e.g. `bytestreams`.
    pub kind: String,
}

/// The connection-layer contract.
///
/// `send` is fire-and-forget into the session's outbound queue and must not
/// block; replies arrive asynchronously through collectors registered
/// before the request is sent.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The full address this connection is bound to.
    fn local_jid(&self) -> &Jid;

    /// Queues a stanza for delivery.
    fn send(&self, stanza: Stanza) -> Result<()>;

    /// Registers a collector receiving every inbound stanza matching the
    /// filter, until the collector is dropped or cancelled.
    fn collect(&self, filter: StanzaFilter) -> Collector;

    /// The namespace tokens the given entity advertises.
    async fn discover_features(&self, target: &Jid) -> Result<HashSet<String>>;

    /// The service items the given entity hosts.
    async fn discover_items(&self, target: &Jid) -> Result<Vec<ServiceRecord>>;

    /// The home service of this connection, queried for relay items.
    fn service_jid(&self) -> Jid {
        Jid::domain_only(self.local_jid().domain())
    }

    /// Produces a stanza id unique within this connection.
    fn next_id(&self) -> String;
}

/// A blocking queue of stanzas matched by a filter.
///
/// Deregisters itself from the connection when dropped, so an abandoned
/// negotiation cannot leak collector registrations.
pub struct Collector {
    rx: mpsc::UnboundedReceiver<Stanza>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Collector {
    /// Wraps a receiver together with the deregistration hook the owning
    /// connection supplies.
    pub fn new(rx: mpsc::UnboundedReceiver<Stanza>, cancel: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            rx,
            cancel: Some(cancel),
        }
    }

    /// Waits up to `timeout` for the next matching stanza.
    ///
    /// Returns `None` on timeout or if the connection is gone; the two are
    /// indistinguishable here on purpose, both mean "no reply".
    pub async fn next(&mut self, timeout: Duration) -> Option<Stanza> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(stanza) => stanza,
            Err(_) => None,
        }
    }

    /// Waits without a timeout. Used by long-lived dispatch loops.
    pub async fn recv(&mut self) -> Option<Stanza> {
        self.rx.recv().await
    }

    /// Poll-based receive, for stream adapters.
    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<Stanza>> {
        self.rx.poll_recv(cx)
    }

    /// Deregisters the collector. Further stanzas are no longer queued.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::Payload;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[tokio::test]
    async fn collector_yields_queued_stanza() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut collector = Collector::new(rx, Box::new(|| {}));

        tx.send(Stanza::new("iq-1", jid("a@x"), jid("b@x"), Payload::Ack))
            .unwrap();
        let stanza = collector.next(Duration::from_millis(100)).await.unwrap();
        assert_eq!(stanza.id, "iq-1");
    }

    #[tokio::test]
    async fn collector_times_out_without_reply() {
        let (_tx, rx) = mpsc::unbounded_channel::<Stanza>();
        let mut collector = Collector::new(rx, Box::new(|| {}));

        let start = tokio::time::Instant::now();
        let result = collector.next(Duration::from_millis(50)).await;
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn drop_runs_the_cancel_hook_once() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let (_tx, rx) = mpsc::unbounded_channel::<Stanza>();
        let mut collector = Collector::new(
            rx,
            Box::new(move || {
                assert!(!flag.swap(true, Ordering::SeqCst), "cancel ran twice");
            }),
        );
        collector.cancel();
        drop(collector);
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
