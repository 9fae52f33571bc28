//! Abstract stanza model for the negotiation protocol.
//!
//! This module defines the field sets the negotiation core exchanges with
//! its peers. Serialization to the wire format is owned by the surrounding
//! connection layer; the core only matches and constructs these shapes.

use bytes::Bytes;

use crate::jid::Jid;

/// A candidate relay or direct endpoint offered during socket negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHost {
    /// The entity that owns this endpoint.
    pub jid: Jid,
    /// Host address, literal IP or resolvable name.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

impl StreamHost {
    pub fn new(jid: Jid, address: impl Into<String>, port: u16) -> Self {
        Self {
            jid,
            address: address.into(),
            port,
        }
    }
}

/// Transport mode flag carried by a candidate host list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Tcp,
    Udp,
}

/// Protocol-level error condition carried by an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    BadRequest,
    Forbidden,
    ItemNotFound,
    NotAcceptable,
    ResourceConstraint,
    UnexpectedRequest,
}

impl ErrorCondition {
    /// Whether this condition signals that the offered methods were not
    /// acceptable to the peer (as opposed to an outright refusal).
    pub fn is_rejection(self) -> bool {
        matches!(self, ErrorCondition::BadRequest | ErrorCondition::NotAcceptable)
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCondition::BadRequest => "bad-request",
            ErrorCondition::Forbidden => "forbidden",
            ErrorCondition::ItemNotFound => "item-not-found",
            ErrorCondition::NotAcceptable => "not-acceptable",
            ErrorCondition::ResourceConstraint => "resource-constraint",
            ErrorCondition::UnexpectedRequest => "unexpected-request",
        };
        f.write_str(s)
    }
}

/// An error reply from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub condition: ErrorCondition,
    pub text: String,
}

impl StanzaError {
    pub fn new(condition: ErrorCondition, text: impl Into<String>) -> Self {
        Self {
            condition,
            text: text.into(),
        }
    }
}

impl std::fmt::Display for StanzaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.text.is_empty() {
            write!(f, "{}", self.condition)
        } else {
            write!(f, "{} ({})", self.condition, self.text)
        }
    }
}

impl std::error::Error for StanzaError {}

/// A transfer offer: file metadata plus the ordered capability-token list
/// (more-preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOffer {
    pub sid: String,
    pub file_name: String,
    pub file_size: u64,
    pub description: String,
    pub methods: Vec<String>,
}

/// The accepting side's reply to an offer, naming the chosen token(s).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSelection {
    pub sid: String,
    pub methods: Vec<String>,
}

/// The ranked candidate-host list sent by the socket method initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateHostList {
    pub sid: String,
    pub hosts: Vec<StreamHost>,
    pub mode: Mode,
}

/// Confirms to the initiator which candidate host was connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsedHostNotice {
    pub sid: String,
    pub jid: Jid,
}

/// Asks a relay to join the two legs of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateRelay {
    pub sid: String,
    pub target: Jid,
}

/// Opens an in-band stream, declaring the block size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBlock {
    pub sid: String,
    pub block_size: u16,
}

/// One in-band data block: base64 payload tagged with a wrapping sequence
/// number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub sid: String,
    pub seq: u16,
    pub data: String,
}

impl DataBlock {
    /// Decodes the base64 payload, or `None` if the encoding is invalid.
    pub fn decoded(&self) -> Option<Bytes> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        STANDARD.decode(&self.data).ok().map(Bytes::from)
    }
}

/// Closes an in-band stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseBlock {
    pub sid: String,
}

/// The payload of a stanza.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Transfer offer (request).
    Offer(TransferOffer),
    /// Offer acceptance naming the chosen method(s) (reply).
    OfferAccept(MethodSelection),
    /// Candidate host list (request).
    Hosts(CandidateHostList),
    /// Query for a relay service's concrete host/port (request).
    HostsQuery,
    /// Used-host confirmation (reply).
    HostUsed(UsedHostNotice),
    /// Relay activation (request).
    Activate(ActivateRelay),
    /// In-band open (request).
    Open(OpenBlock),
    /// In-band data block.
    Data(DataBlock),
    /// In-band close (request).
    Close(CloseBlock),
    /// Empty positive reply.
    Ack,
    /// Error reply.
    Error(StanzaError),
}

/// Discriminant of [`Payload`], used by filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Offer,
    OfferAccept,
    Hosts,
    HostsQuery,
    HostUsed,
    Activate,
    Open,
    Data,
    Close,
    Ack,
    Error,
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Offer(_) => PayloadKind::Offer,
            Payload::OfferAccept(_) => PayloadKind::OfferAccept,
            Payload::Hosts(_) => PayloadKind::Hosts,
            Payload::HostsQuery => PayloadKind::HostsQuery,
            Payload::HostUsed(_) => PayloadKind::HostUsed,
            Payload::Activate(_) => PayloadKind::Activate,
            Payload::Open(_) => PayloadKind::Open,
            Payload::Data(_) => PayloadKind::Data,
            Payload::Close(_) => PayloadKind::Close,
            Payload::Ack => PayloadKind::Ack,
            Payload::Error(_) => PayloadKind::Error,
        }
    }

    /// The session id this payload belongs to, if it carries one.
    pub fn sid(&self) -> Option<&str> {
        match self {
            Payload::Offer(p) => Some(&p.sid),
            Payload::OfferAccept(p) => Some(&p.sid),
            Payload::Hosts(p) => Some(&p.sid),
            Payload::HostUsed(p) => Some(&p.sid),
            Payload::Activate(p) => Some(&p.sid),
            Payload::Open(p) => Some(&p.sid),
            Payload::Data(p) => Some(&p.sid),
            Payload::Close(p) => Some(&p.sid),
            Payload::HostsQuery | Payload::Ack | Payload::Error(_) => None,
        }
    }
}

/// One addressed protocol message.
///
/// Replies carry the id of the request they answer; that correlation is the
/// only ordering the core assumes from the connection layer beyond in-order
/// delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    pub id: String,
    pub from: Jid,
    pub to: Jid,
    pub payload: Payload,
}

impl Stanza {
    pub fn new(id: impl Into<String>, from: Jid, to: Jid, payload: Payload) -> Self {
        Self {
            id: id.into(),
            from,
            to,
            payload,
        }
    }

    /// Builds a reply to this stanza: same id, from/to swapped.
    pub fn reply(&self, payload: Payload) -> Stanza {
        Stanza {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            payload,
        }
    }

    /// Builds an error reply to this stanza.
    pub fn error_reply(&self, condition: ErrorCondition, text: impl Into<String>) -> Stanza {
        self.reply(Payload::Error(StanzaError::new(condition, text)))
    }
}

/// Matches stanzas delivered to a collector.
#[derive(Debug, Clone)]
pub enum StanzaFilter {
    /// Matches replies to the request with this id.
    Id(String),
    /// Matches any stanza whose payload is one of the given kinds.
    Kinds(Vec<PayloadKind>),
    /// Matches session-scoped stanzas from a specific peer.
    Session {
        from: Jid,
        sid: String,
        kinds: Vec<PayloadKind>,
    },
    /// Matches if any of the inner filters match.
    Any(Vec<StanzaFilter>),
}

impl StanzaFilter {
    pub fn matches(&self, stanza: &Stanza) -> bool {
        match self {
            StanzaFilter::Id(id) => stanza.id == *id,
            StanzaFilter::Kinds(kinds) => kinds.contains(&stanza.payload.kind()),
            StanzaFilter::Session { from, sid, kinds } => {
                stanza.from == *from
                    && stanza.payload.sid() == Some(sid.as_str())
                    && kinds.contains(&stanza.payload.kind())
            }
            StanzaFilter::Any(filters) => filters.iter().any(|f| f.matches(stanza)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn data_stanza(from: &str, to: &str, sid: &str, seq: u16) -> Stanza {
        Stanza::new(
            "iq-1",
            jid(from),
            jid(to),
            Payload::Data(DataBlock {
                sid: sid.to_string(),
                seq,
                data: String::new(),
            }),
        )
    }

    #[test]
    fn id_filter_matches_replies_only_by_id() {
        let stanza = Stanza::new("iq-7", jid("a@x/r"), jid("b@x/r"), Payload::Ack);
        assert!(StanzaFilter::Id("iq-7".to_string()).matches(&stanza));
        assert!(!StanzaFilter::Id("iq-8".to_string()).matches(&stanza));
    }

    #[test]
    fn session_filter_requires_peer_sid_and_kind() {
        let stanza = data_stanza("a@x/r", "b@x/r", "s1", 0);

        let hit = StanzaFilter::Session {
            from: jid("a@x/r"),
            sid: "s1".to_string(),
            kinds: vec![PayloadKind::Data, PayloadKind::Close],
        };
        assert!(hit.matches(&stanza));

        let wrong_peer = StanzaFilter::Session {
            from: jid("c@x/r"),
            sid: "s1".to_string(),
            kinds: vec![PayloadKind::Data],
        };
        assert!(!wrong_peer.matches(&stanza));

        let wrong_sid = StanzaFilter::Session {
            from: jid("a@x/r"),
            sid: "s2".to_string(),
            kinds: vec![PayloadKind::Data],
        };
        assert!(!wrong_sid.matches(&stanza));

        let wrong_kind = StanzaFilter::Session {
            from: jid("a@x/r"),
            sid: "s1".to_string(),
            kinds: vec![PayloadKind::Open],
        };
        assert!(!wrong_kind.matches(&stanza));
    }

    #[test]
    fn any_filter_is_a_union() {
        let stanza = data_stanza("a@x/r", "b@x/r", "s1", 0);
        let union = StanzaFilter::Any(vec![
            StanzaFilter::Id("other".to_string()),
            StanzaFilter::Kinds(vec![PayloadKind::Data]),
        ]);
        assert!(union.matches(&stanza));

        let miss = StanzaFilter::Any(vec![
            StanzaFilter::Id("other".to_string()),
            StanzaFilter::Kinds(vec![PayloadKind::Open]),
        ]);
        assert!(!miss.matches(&stanza));
    }

    #[test]
    fn reply_swaps_addressing_and_keeps_id() {
        let stanza = data_stanza("a@x/r", "b@x/r", "s1", 3);
        let reply = stanza.reply(Payload::Ack);
        assert_eq!(reply.id, "iq-1");
        assert_eq!(reply.from, jid("b@x/r"));
        assert_eq!(reply.to, jid("a@x/r"));
    }

    #[test]
    fn error_reply_carries_condition() {
        let stanza = data_stanza("a@x/r", "b@x/r", "s1", 3);
        let reply = stanza.error_reply(ErrorCondition::Forbidden, "offer declined");
        match reply.payload {
            Payload::Error(e) => {
                assert_eq!(e.condition, ErrorCondition::Forbidden);
                assert_eq!(e.text, "offer declined");
            }
            other => panic!("expected error payload, got {:?}", other),
        }
    }

    #[test]
    fn data_block_decodes_valid_base64() {
        let block = DataBlock {
            sid: "s1".to_string(),
            seq: 0,
            data: "aGVsbG8=".to_string(),
        };
        assert_eq!(block.decoded().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn data_block_rejects_invalid_base64() {
        let block = DataBlock {
            sid: "s1".to_string(),
            seq: 0,
            data: "not base64!!".to_string(),
        };
        assert!(block.decoded().is_none());
    }
}
