//! File-transfer stream negotiation over a stanza-based session.
//!
//! This crate negotiates a transport for a file transfer between two
//! endpoints, falls back transparently between methods on failure, and
//! moves the bytes while exposing transfer progress and lifecycle state.
//! Two stream methods are provided: a SOCKS5 bytestream over a direct or
//! relayed TCP socket, and an in-band bytestream tunnelling the data as
//! ordinary protocol messages.
//!
//! The surrounding session layer is consumed only through the
//! [`Connection`] trait: send a stanza, collect replies matching a filter
//! with a timeout, and run service discovery. The [`pair`] module ships an
//! in-process loopback implementation of that trait.

pub mod connection;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod fallback;
pub mod inband;
pub mod jid;
pub mod method;
pub mod negotiator;
pub mod pair;
pub mod relay;
pub mod socks5;
pub mod stanza;
pub mod transfer;

pub use connection::{Collector, Connection, ServiceRecord};
pub use coordinator::{OfferRequest, TransferCoordinator};
pub use digest::session_digest;
pub use error::{Error, ErrorKind, Result};
pub use fallback::FallbackMethod;
pub use inband::InBandMethod;
pub use jid::Jid;
pub use method::{ByteSink, ByteSource, StreamMethod, StreamSession};
pub use negotiator::{NegotiatorConfig, TransferNegotiator};
pub use pair::{linked_pair, PairEndpoint};
pub use relay::RelayCoordinator;
pub use socks5::Socks5Method;
pub use stanza::{
    ActivateRelay, CandidateHostList, CloseBlock, DataBlock, ErrorCondition, MethodSelection,
    Mode, OpenBlock, Payload, PayloadKind, Stanza, StanzaError, StanzaFilter, StreamHost,
    TransferOffer, UsedHostNotice,
};
pub use transfer::{
    Direction, IncomingTransfer, OutgoingTransfer, Status, StatusCell, Transfer, TransferEvent,
};
