//! SOCKS5 stream method.
//!
//! Negotiates a real TCP byte stream, either directly to a peer-offered
//! stream host or through a relay. The handshake follows the bytestream
//! profile: "no authentication" only, with the session digest carried as
//! the destination domain name, so the relay can match the two legs of a
//! session without either side disclosing the digest in a stanza.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::connection::Connection;
use crate::digest::session_digest;
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::method::{ByteSink, ByteSource, StreamMethod, StreamSession};
use crate::negotiator::NegotiatorConfig;
use crate::relay::RelayCoordinator;
use crate::stanza::{
    CandidateHostList, ErrorCondition, Mode, Payload, PayloadKind, Stanza, StanzaFilter,
    StreamHost, UsedHostNotice,
};

/// Capability token for the SOCKS5 bytestream method.
pub const NAMESPACE: &str = "http://jabber.org/protocol/bytestreams";

/// Connection failures after which a stream host address is skipped.
const CONNECT_FAILURE_THRESHOLD: u32 = 2;

/// Bound on one TCP connect attempt to a candidate host.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xff;
const ATYP_DOMAIN: u8 = 0x03;

/// The socket stream method.
///
/// Owned by the negotiator; stateless between negotiations apart from the
/// lazily discovered relay-host cache and the per-address failure counts.
pub struct Socks5Method {
    connection: Arc<dyn Connection>,
    relay: Arc<RelayCoordinator>,
    config: Arc<NegotiatorConfig>,
    /// Relay hosts discovered once and reused for the negotiator lifetime.
    hosts_cache: Mutex<Option<Vec<StreamHost>>>,
    /// Per-address connect-failure counts for candidate skipping.
    failures: StdMutex<HashMap<String, u32>>,
}

impl Socks5Method {
    pub fn new(
        connection: Arc<dyn Connection>,
        relay: Arc<RelayCoordinator>,
        config: Arc<NegotiatorConfig>,
    ) -> Self {
        Self {
            connection,
            relay,
            config,
            hosts_cache: Mutex::new(None),
            failures: StdMutex::new(HashMap::new()),
        }
    }

    fn connect_failures(&self, address: &str) -> u32 {
        self.failures
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    fn record_failure(&self, address: &str) {
        *self
            .failures
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_insert(0) += 1;
    }

    /// The discovered relay hosts, computed once per negotiator.
    async fn relay_hosts(&self) -> Vec<StreamHost> {
        let mut cache = self.hosts_cache.lock().await;
        if let Some(hosts) = cache.as_ref() {
            return hosts.clone();
        }
        let hosts = self.discover_relay_hosts().await;
        *cache = Some(hosts.clone());
        hosts
    }

    async fn discover_relay_hosts(&self) -> Vec<StreamHost> {
        let service = self.connection.service_jid();
        let items = match self.connection.discover_items(&service).await {
            Ok(items) => items,
            Err(e) => {
                tracing::debug!(error = %e, "relay discovery failed");
                return Vec::new();
            }
        };

        let mut hosts = Vec::new();
        for item in items {
            if !(item.category.eq_ignore_ascii_case("proxy")
                && item.kind.eq_ignore_ascii_case("bytestreams"))
            {
                continue;
            }
            match self.query_relay_host(&item.jid).await {
                Ok(mut found) => hosts.append(&mut found),
                Err(e) => {
                    tracing::debug!(relay = %item.jid, error = %e, "relay host query failed");
                }
            }
        }
        tracing::debug!(count = hosts.len(), "relay hosts discovered");
        hosts
    }

    /// Asks one relay service for its concrete host/port.
    async fn query_relay_host(&self, relay: &Jid) -> Result<Vec<StreamHost>> {
        let id = self.connection.next_id();
        let mut collector = self.connection.collect(StanzaFilter::Id(id.clone()));
        self.connection.send(Stanza::new(
            id,
            self.connection.local_jid().clone(),
            relay.clone(),
            Payload::HostsQuery,
        ))?;

        let reply = collector
            .next(self.config.response_timeout)
            .await
            .ok_or(Error::ReplyTimeout(
                "relay host query",
                self.config.response_timeout,
            ))?;
        match reply.payload {
            Payload::Hosts(list) => Ok(list.hosts),
            Payload::Error(e) => Err(Error::Remote(e)),
            other => Err(Error::UnexpectedReply(format!(
                "relay answered host query with {:?}",
                other.kind()
            ))),
        }
    }

    async fn open_outgoing_inner(
        &self,
        session: &StreamSession,
        digest: &str,
        local_port: Option<u16>,
    ) -> Result<ByteSink> {
        let local_jid = self.connection.local_jid().clone();

        let mut hosts = Vec::new();
        if let Some(port) = local_port {
            hosts.push(StreamHost::new(
                local_jid.clone(),
                local_address().to_string(),
                port,
            ));
        }
        hosts.extend(self.relay_hosts().await);

        let id = self.connection.next_id();
        let mut collector = self.connection.collect(StanzaFilter::Id(id.clone()));
        self.connection.send(Stanza::new(
            id,
            local_jid.clone(),
            session.target.clone(),
            Payload::Hosts(CandidateHostList {
                sid: session.sid.clone(),
                hosts: hosts.clone(),
                mode: Mode::Tcp,
            }),
        ))?;

        let reply = collector
            .next(self.config.response_timeout)
            .await
            .ok_or(Error::ReplyTimeout(
                "stream host offer",
                self.config.response_timeout,
            ))?;
        collector.cancel();

        let used = match reply.payload {
            Payload::HostUsed(used) => used,
            Payload::Error(e) => return Err(Error::Remote(e)),
            other => {
                return Err(Error::UnexpectedReply(format!(
                    "expected a used-host notice, got {:?}",
                    other.kind()
                )))
            }
        };
        let host = hosts
            .iter()
            .find(|h| h.jid == used.jid)
            .ok_or_else(|| {
                Error::UnexpectedReply("peer confirmed a host that was never offered".to_string())
            })?
            .clone();

        if host.jid == local_jid {
            // this endpoint is the relay; the peer connects back to us
            let stream = self
                .relay
                .take_socket(digest, self.config.response_timeout)
                .await
                .ok_or(Error::ReplyTimeout(
                    "relayed connection",
                    self.config.response_timeout,
                ))?;
            tracing::debug!(sid = %session.sid, "peer connected through the local stream host");
            let (_read, write) = stream.into_split();
            Ok(Box::new(write))
        } else {
            let mut stream = connect_host(&host).await?;
            connect_handshake(&mut stream, digest).await?;
            self.activate_relay(session, &host.jid).await?;
            tracing::debug!(sid = %session.sid, relay = %host.jid, "relay activated");
            let (_read, write) = stream.into_split();
            Ok(Box::new(write))
        }
    }

    /// Asks the relay to join the two legs of the session.
    async fn activate_relay(&self, session: &StreamSession, relay: &Jid) -> Result<()> {
        let id = self.connection.next_id();
        let mut collector = self.connection.collect(StanzaFilter::Id(id.clone()));
        self.connection.send(Stanza::new(
            id,
            self.connection.local_jid().clone(),
            relay.clone(),
            Payload::Activate(crate::stanza::ActivateRelay {
                sid: session.sid.clone(),
                target: session.target.clone(),
            }),
        ))?;

        let reply = collector
            .next(self.config.response_timeout)
            .await
            .ok_or(Error::ReplyTimeout(
                "relay activation",
                self.config.response_timeout,
            ))?;
        match reply.payload {
            Payload::Ack => Ok(()),
            Payload::Error(e) => Err(Error::Remote(e)),
            other => Err(Error::UnexpectedReply(format!(
                "relay answered activation with {:?}",
                other.kind()
            ))),
        }
    }

    async fn try_host(&self, host: &StreamHost, digest: &str) -> Result<TcpStream> {
        let mut stream = connect_host(host).await?;
        connect_handshake(&mut stream, digest).await?;
        Ok(stream)
    }
}

#[async_trait]
impl StreamMethod for Socks5Method {
    fn tokens(&self) -> Vec<&'static str> {
        vec![NAMESPACE]
    }

    fn initiation_filter(&self, from: &Jid, sid: &str) -> StanzaFilter {
        StanzaFilter::Session {
            from: from.clone(),
            sid: sid.to_string(),
            kinds: vec![PayloadKind::Hosts],
        }
    }

    async fn open_outgoing(&self, session: &StreamSession) -> Result<ByteSink> {
        let digest = session_digest(&session.sid, &session.initiator, &session.target);

        // failure to open the local listener is non-fatal; the offer then
        // carries discovered relays only
        let local_port = match self.relay.register_transfer().await {
            Ok(port) => Some(port),
            Err(e) => {
                tracing::warn!(error = %e, "could not open a local stream host");
                None
            }
        };

        let result = self
            .open_outgoing_inner(session, &digest, local_port)
            .await;
        if local_port.is_some() {
            self.relay.unregister_transfer().await;
        }
        result
    }

    async fn open_incoming(&self, initiation: Stanza) -> Result<ByteSource> {
        let list = match &initiation.payload {
            Payload::Hosts(list) => list.clone(),
            other => {
                return Err(Error::UnexpectedReply(format!(
                    "expected a stream host list, got {:?}",
                    other.kind()
                )))
            }
        };
        // the offerer is the initiator, this endpoint is the target
        let digest = session_digest(&list.sid, &initiation.from, &initiation.to);

        for host in &list.hosts {
            if self.connect_failures(&host.address) >= CONNECT_FAILURE_THRESHOLD {
                tracing::debug!(address = %host.address, "skipping blacklisted stream host");
                continue;
            }
            match self.try_host(host, &digest).await {
                Ok(stream) => {
                    self.connection.send(initiation.reply(Payload::HostUsed(
                        UsedHostNotice {
                            sid: list.sid.clone(),
                            jid: host.jid.clone(),
                        },
                    )))?;
                    tracing::debug!(sid = %list.sid, host = %host.jid, "stream host connected");
                    let (read, _write) = stream.into_split();
                    return Ok(Box::new(read));
                }
                Err(e) => {
                    tracing::debug!(address = %host.address, error = %e, "stream host unreachable");
                    self.record_failure(&host.address);
                }
            }
        }

        // tell the initiator before failing locally, so its collector does
        // not run into its timeout
        let _ = self.connection.send(initiation.error_reply(
            ErrorCondition::ItemNotFound,
            "could not connect to any offered stream host",
        ));
        Err(Error::NoUsableHost)
    }
}

async fn connect_host(host: &StreamHost) -> Result<TcpStream> {
    tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((host.address.as_str(), host.port)),
    )
    .await
    .map_err(|_| Error::Socks(format!("connect to {}:{} timed out", host.address, host.port)))?
    .map_err(Error::Io)
}

/// The address advertised for the local stream host.
///
/// Picks the default-route interface address without sending any packets;
/// falls back to loopback when no route is known.
fn local_address() -> IpAddr {
    std::net::UdpSocket::bind(("0.0.0.0", 0))
        .and_then(|socket| socket.connect(("8.8.8.8", 53)).map(|_| socket))
        .and_then(|socket| socket.local_addr())
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Builds the SOCKS5 request/reply message carrying the digest as the
/// destination domain name, port zero.
fn socks5_message(cmd: u8, digest: &str) -> Vec<u8> {
    let addr = digest.as_bytes();
    debug_assert!(addr.len() <= u8::MAX as usize);
    let mut msg = Vec::with_capacity(7 + addr.len());
    msg.push(SOCKS_VERSION);
    msg.push(cmd);
    msg.push(0x00);
    msg.push(ATYP_DOMAIN);
    msg.push(addr.len() as u8);
    msg.extend_from_slice(addr);
    msg.extend_from_slice(&[0x00, 0x00]);
    msg
}

/// Reads one SOCKS5 request/reply and returns its domain field.
async fn read_socks5_message<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::Socks(format!(
            "unsupported version {:#04x}",
            header[0]
        )));
    }
    if header[3] != ATYP_DOMAIN {
        return Err(Error::Socks(format!(
            "unsupported address type {:#04x}",
            header[3]
        )));
    }
    let mut addr = vec![0u8; header[4] as usize];
    stream.read_exact(&mut addr).await?;
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    String::from_utf8(addr).map_err(|_| Error::Socks("digest is not valid UTF-8".to_string()))
}

/// Client half of the handshake against a stream host.
pub(crate) async fn connect_handshake<S>(stream: &mut S, digest: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(Error::Socks(
            "host did not grant no-authentication".to_string(),
        ));
    }

    stream.write_all(&socks5_message(0x01, digest)).await?;
    let echoed = read_socks5_message(stream).await?;
    if echoed != digest {
        return Err(Error::Socks("host echoed a different digest".to_string()));
    }
    Ok(())
}

/// Server half of the handshake, run by the relay listener. Returns the
/// digest the connecting peer presented.
pub(crate) async fn serve_handshake<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(Error::Socks(format!(
            "unsupported version {:#04x}",
            greeting[0]
        )));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        let _ = stream
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS])
            .await;
        return Err(Error::Socks(
            "peer offered no supported authentication method".to_string(),
        ));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let digest = read_socks5_message(stream).await?;
    stream.write_all(&socks5_message(0x00, &digest)).await?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_message_layout() {
        let msg = socks5_message(0x01, "abcd");
        assert_eq!(
            msg,
            vec![0x05, 0x01, 0x00, 0x03, 0x04, b'a', b'b', b'c', b'd', 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn handshake_roundtrip_exchanges_the_digest() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let digest = "f00dfeed".to_string();

        let server_task = tokio::spawn(async move { serve_handshake(&mut server).await });
        connect_handshake(&mut client, &digest).await.unwrap();

        let presented = server_task.await.unwrap().unwrap();
        assert_eq!(presented, digest);
    }

    #[tokio::test]
    async fn serve_handshake_rejects_wrong_version() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move { serve_handshake(&mut server).await });

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(Error::Socks(_))));
    }

    #[tokio::test]
    async fn serve_handshake_requires_no_auth_method() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move { serve_handshake(&mut server).await });

        // offers only username/password auth
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xff]);
        assert!(matches!(server_task.await.unwrap(), Err(Error::Socks(_))));
    }

    #[tokio::test]
    async fn connect_handshake_rejects_auth_denial() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let client_task =
            tokio::spawn(async move { connect_handshake(&mut client, "digest").await });

        let mut greeting = [0u8; 3];
        server.read_exact(&mut greeting).await.unwrap();
        server.write_all(&[0x05, 0xff]).await.unwrap();

        assert!(matches!(client_task.await.unwrap(), Err(Error::Socks(_))));
    }

    #[tokio::test]
    async fn failure_counting_reaches_the_blacklist_threshold() {
        let (endpoint, _peer) = crate::pair::linked_pair(
            Jid::parse("a@x/r").unwrap(),
            Jid::parse("b@x/r").unwrap(),
        );
        let method = Socks5Method::new(
            endpoint,
            RelayCoordinator::new(),
            Arc::new(NegotiatorConfig::default()),
        );

        assert_eq!(method.connect_failures("192.0.2.1"), 0);
        method.record_failure("192.0.2.1");
        assert!(method.connect_failures("192.0.2.1") < CONNECT_FAILURE_THRESHOLD);
        method.record_failure("192.0.2.1");
        assert!(method.connect_failures("192.0.2.1") >= CONNECT_FAILURE_THRESHOLD);
        assert_eq!(method.connect_failures("192.0.2.2"), 0);
    }
}
