//! Datagram transports
//!
//! A [`Transport`] moves encoded frames between member addresses. Delivery is
//! unreliable and unordered; the protocol layers above retry what matters.
//! Inbound frames are handed out on an `mpsc` channel returned when the
//! transport is created.

use crate::error::{MembershipError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Largest payload a UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

const RECV_RETRY_MIN: Duration = Duration::from_millis(10);
const RECV_RETRY_MAX: Duration = Duration::from_secs(1);

/// Frame received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub payload: Bytes,
}

/// Outbound side of a member's network endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address peers use to reach this endpoint
    fn local_addr(&self) -> SocketAddr;

    async fn send(&self, to: SocketAddr, payload: Bytes) -> Result<()>;
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<SocketAddr, mpsc::Sender<Datagram>>,
    isolated: HashSet<SocketAddr>,
    /// Directed links that drop traffic
    cut: HashSet<(SocketAddr, SocketAddr)>,
}

impl NetworkState {
    fn reachable(&self, from: SocketAddr, to: SocketAddr) -> bool {
        !self.isolated.contains(&from) && !self.isolated.contains(&to) && !self.cut.contains(&(from, to))
    }
}

/// Process-local network for tests and simulations, with partition
/// injection
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint at `addr`
    pub async fn register(&self, addr: SocketAddr, capacity: usize) -> Result<(MemoryTransport, mpsc::Receiver<Datagram>)> {
        let mut state = self.state.write().await;
        if state.endpoints.contains_key(&addr) {
            return Err(MembershipError::transport(format!("Address {} already registered", addr)));
        }

        let (sender, receiver) = mpsc::channel(capacity.max(1));
        state.endpoints.insert(addr, sender);
        tracing::debug!("Registered in-memory endpoint {}", addr);

        Ok((
            MemoryTransport {
                addr,
                network: self.clone(),
            },
            receiver,
        ))
    }

    /// Detach an endpoint; later sends to it fail
    pub async fn unregister(&self, addr: SocketAddr) {
        let mut state = self.state.write().await;
        state.endpoints.remove(&addr);
        state.isolated.remove(&addr);
    }

    /// Drop all traffic to and from `addr`
    pub async fn isolate(&self, addr: SocketAddr) {
        tracing::debug!("Isolating {}", addr);
        self.state.write().await.isolated.insert(addr);
    }

    /// Drop traffic between `a` and `b` in both directions
    pub async fn partition(&self, a: SocketAddr, b: SocketAddr) {
        let mut state = self.state.write().await;
        state.cut.insert((a, b));
        state.cut.insert((b, a));
    }

    /// Restore every link
    pub async fn heal(&self) {
        let mut state = self.state.write().await;
        state.isolated.clear();
        state.cut.clear();
    }

    pub async fn is_reachable(&self, from: SocketAddr, to: SocketAddr) -> bool {
        let state = self.state.read().await;
        state.endpoints.contains_key(&to) && state.reachable(from, to)
    }

    async fn deliver(&self, from: SocketAddr, to: SocketAddr, payload: Bytes) -> Result<()> {
        let sender = {
            let state = self.state.read().await;
            if !state.reachable(from, to) {
                tracing::trace!("Dropping {} bytes from {} to {}: partitioned", payload.len(), from, to);
                return Ok(());
            }
            state
                .endpoints
                .get(&to)
                .cloned()
                .ok_or_else(|| MembershipError::transport(format!("No endpoint at {}", to)))?
        };

        sender
            .try_send(Datagram { from, payload })
            .map_err(|e| MembershipError::transport(format!("Delivery to {} failed: {}", to, e)))
    }
}

/// Endpoint of an [`InMemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    addr: SocketAddr,
    network: InMemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, to: SocketAddr, payload: Bytes) -> Result<()> {
        self.network.deliver(self.addr, to, payload).await
    }
}

/// UDP endpoint backed by a tokio socket
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    receiver: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind `addr` and start forwarding inbound datagrams to the returned
    /// channel
    pub async fn bind(addr: SocketAddr, capacity: usize) -> Result<(Self, mpsc::Receiver<Datagram>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| MembershipError::transport(format!("Failed to bind {}: {}", addr, e)))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(receive_loop(socket.clone(), sender));

        tracing::info!("UDP transport listening on {}", local_addr);
        Ok((
            Self {
                socket,
                local_addr,
                receiver: handle,
            },
            receiver,
        ))
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, to: SocketAddr, payload: Bytes) -> Result<()> {
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(MembershipError::transport(format!(
                "Frame of {} bytes exceeds the datagram limit",
                payload.len()
            )));
        }
        self.socket.send_to(&payload, to).await?;
        Ok(())
    }
}

/// Pause after the `failures`-th receive error in a row
fn recv_retry_delay(failures: u32) -> Duration {
    RECV_RETRY_MIN
        .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1)))
        .min(RECV_RETRY_MAX)
}

async fn receive_loop(socket: Arc<UdpSocket>, sender: mpsc::Sender<Datagram>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut failures = 0u32;
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => {
                failures = 0;
                received
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = recv_retry_delay(failures);
                tracing::warn!("UDP receive error ({} in a row), retrying in {:?}: {}", failures, delay, e);
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let datagram = Datagram {
            from,
            payload: Bytes::copy_from_slice(&buf[..len]),
        };
        if sender.send(datagram).await.is_err() {
            tracing::debug!("Inbound channel closed, stopping UDP receiver");
            break;
        }
    }
}
