//! Fallback composite over two stream methods.
//!
//! Wraps a primary and a secondary method so callers see one. Outbound, the
//! secondary is tried exactly once after any primary failure and its
//! failure, not the primary's, is what propagates. Inbound, the composite
//! waits once on the union of both initiation filters and dispatches on
//! whichever actually matched, avoiding a second offer round trip.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::method::{ByteSink, ByteSource, StreamMethod, StreamSession};
use crate::stanza::{Stanza, StanzaFilter};

/// Composes two stream methods, primary first.
pub struct FallbackMethod {
    primary: Arc<dyn StreamMethod>,
    secondary: Arc<dyn StreamMethod>,
}

impl FallbackMethod {
    pub fn new(primary: Arc<dyn StreamMethod>, secondary: Arc<dyn StreamMethod>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl StreamMethod for FallbackMethod {
    fn tokens(&self) -> Vec<&'static str> {
        let mut tokens = self.primary.tokens();
        tokens.extend(self.secondary.tokens());
        tokens
    }

    fn initiation_filter(&self, from: &Jid, sid: &str) -> StanzaFilter {
        StanzaFilter::Any(vec![
            self.primary.initiation_filter(from, sid),
            self.secondary.initiation_filter(from, sid),
        ])
    }

    async fn open_outgoing(&self, session: &StreamSession) -> Result<ByteSink> {
        match self.primary.open_outgoing(session).await {
            Ok(sink) => Ok(sink),
            Err(e) => {
                tracing::debug!(sid = %session.sid, error = %e, "primary method failed, falling back");
                self.secondary.open_outgoing(session).await
            }
        }
    }

    async fn open_incoming(&self, initiation: Stanza) -> Result<ByteSource> {
        let sid = initiation.payload.sid().unwrap_or_default().to_string();
        if self
            .primary
            .initiation_filter(&initiation.from, &sid)
            .matches(&initiation)
        {
            self.primary.open_incoming(initiation).await
        } else if self
            .secondary
            .initiation_filter(&initiation.from, &sid)
            .matches(&initiation)
        {
            self.secondary.open_incoming(initiation).await
        } else {
            Err(Error::UnexpectedReply(format!(
                "initiation {:?} matches neither composed method",
                initiation.payload.kind()
            )))
        }
    }
}
