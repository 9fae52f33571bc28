//! Local relay listener for the socket method.
//!
//! When this endpoint initiates a socket transfer it can offer itself as a
//! stream host. The coordinator runs one listener per connection, lazily
//! started on the first outbound socket negotiation. Inbound connections
//! authenticate with the SOCKS5 handshake; the digest they present keys
//! them into a table the owning transfer consumes exactly once.
//!
//! The accept loop parks while no transfer needs relaying and uses a
//! bounded accept timeout so it can observe shutdown. A malformed inbound
//! connection only fails its own handshake, never the loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::socks5::serve_handshake;

/// How long one accept call blocks before re-checking shutdown.
const ACCEPT_POLL: Duration = Duration::from_secs(10);

/// Bound on a single inbound handshake, so a stalled client cannot hold
/// the accept loop.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RelayState {
    /// Authenticated sockets keyed by the digest they presented.
    table: HashMap<String, TcpStream>,
    /// Number of outbound negotiations currently expecting a connection.
    pending: usize,
    port: Option<u16>,
    running: bool,
}

/// Owns the listener, its accept-loop task and the connection table.
pub struct RelayCoordinator {
    state: Mutex<RelayState>,
    shutdown: AtomicBool,
    /// Wakes a parked accept loop when a transfer registers.
    wake: Notify,
    /// Wakes [`take_socket`](Self::take_socket) waiters on table changes.
    table_changed: Notify,
}

impl RelayCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RelayState::default()),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
            table_changed: Notify::new(),
        })
    }

    /// Registers one transfer expecting a relayed connection, starting the
    /// listener if necessary. Returns the listening port.
    pub async fn register_transfer(self: &Arc<Self>) -> std::io::Result<u16> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "relay coordinator is shut down",
            ));
        }
        let mut state = self.state.lock().await;
        if !state.running {
            let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
            let port = listener.local_addr()?.port();
            state.port = Some(port);
            state.running = true;
            tokio::spawn(Arc::clone(self).accept_loop(listener));
        }
        state.pending += 1;
        let port = state.port.expect("listener running without a port");
        drop(state);
        self.wake.notify_one();
        Ok(port)
    }

    /// Releases a registration made by
    /// [`register_transfer`](Self::register_transfer).
    pub async fn unregister_transfer(&self) {
        let mut state = self.state.lock().await;
        state.pending = state.pending.saturating_sub(1);
    }

    /// Waits up to `wait` for an authenticated connection keyed by
    /// `digest`, removing it from the table.
    pub async fn take_socket(&self, digest: &str, wait: Duration) -> Option<TcpStream> {
        let deadline = Instant::now() + wait;
        loop {
            // register before checking so a concurrent insert cannot be
            // missed between the check and the await
            let notified = self.table_changed.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(stream) = state.table.remove(digest) {
                    return Some(stream);
                }
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    /// Stops the listener and discards any queued connections. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_waiters();
        self.table_changed.notify_waiters();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        tracing::debug!(port, "relay listener started");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            // park while no transfer needs relaying
            if self.state.lock().await.pending == 0 {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(ACCEPT_POLL) => {}
                }
                continue;
            }

            match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "relay accept failed");
                    continue;
                }
                Ok(Ok((mut stream, addr))) => {
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, serve_handshake(&mut stream))
                        .await
                    {
                        Ok(Ok(digest)) => {
                            tracing::debug!(%addr, "relay connection registered");
                            self.state.lock().await.table.insert(digest, stream);
                            self.table_changed.notify_waiters();
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(%addr, error = %e, "relay handshake rejected");
                        }
                        Err(_) => {
                            tracing::debug!(%addr, "relay handshake timed out");
                        }
                    }
                }
            }
        }

        let mut state = self.state.lock().await;
        state.table.clear();
        state.running = false;
        state.port = None;
        drop(state);
        self.table_changed.notify_waiters();
        tracing::debug!(port, "relay listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks5::connect_handshake;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn connect_with_digest(port: u16, digest: &str) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        connect_handshake(&mut stream, digest).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn authenticated_connection_is_claimable_by_digest() {
        let relay = RelayCoordinator::new();
        let port = relay.register_transfer().await.unwrap();

        let mut client = connect_with_digest(port, "digest-1").await;

        let mut relayed = relay
            .take_socket("digest-1", Duration::from_secs(2))
            .await
            .expect("connection should be registered");

        client.write_all(b"through the relay").await.unwrap();
        let mut buf = [0u8; 17];
        relayed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the relay");

        relay.unregister_transfer().await;
        relay.shutdown();
    }

    #[tokio::test]
    async fn entries_are_consumed_exactly_once() {
        let relay = RelayCoordinator::new();
        let port = relay.register_transfer().await.unwrap();

        let _client = connect_with_digest(port, "digest-once").await;
        assert!(relay
            .take_socket("digest-once", Duration::from_secs(2))
            .await
            .is_some());
        assert!(relay
            .take_socket("digest-once", Duration::from_millis(100))
            .await
            .is_none());

        relay.shutdown();
    }

    #[tokio::test]
    async fn take_socket_times_out_when_nothing_connects() {
        let relay = RelayCoordinator::new();
        let _port = relay.register_transfer().await.unwrap();

        let start = Instant::now();
        let taken = relay.take_socket("absent", Duration::from_millis(100)).await;
        assert!(taken.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));

        relay.shutdown();
    }

    #[tokio::test]
    async fn malformed_handshake_does_not_break_the_accept_loop() {
        let relay = RelayCoordinator::new();
        let port = relay.register_transfer().await.unwrap();
        relay.register_transfer().await.unwrap();

        // not SOCKS at all; the loop must reject it and keep accepting
        let mut garbage = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        garbage.write_all(b"\x04\x01junk").await.unwrap();

        let _good = connect_with_digest(port, "digest-after-garbage").await;
        assert!(relay
            .take_socket("digest-after-garbage", Duration::from_secs(2))
            .await
            .is_some());

        relay.shutdown();
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiters_and_refuses_new_transfers() {
        let relay = RelayCoordinator::new();
        let _port = relay.register_transfer().await.unwrap();

        let waiter = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.take_socket("never", Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        relay.shutdown();

        let taken = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should unblock promptly")
            .unwrap();
        assert!(taken.is_none());
        assert!(relay.register_transfer().await.is_err());
    }
}
