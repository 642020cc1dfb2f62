//! Relay fallback for peers that cannot reach each other directly
//!
//! The relay is colocated with the control plane rather than deployed as a
//! standalone TURN server. Each peer connects, presents the allocation id
//! agreed during negotiation, and the server pairs the two connections and
//! copies bytes between them.
//!
//! Handshake on every relay connection:
//! 1. client -> server: [`RelayHello`] (length-prefixed JSON)
//! 2. server -> client: [`DialResponse`], empty error once the allocation is
//!    accepted (pairing happens afterwards)

use agentgate_connection::bridge;
use agentgate_proto::{read_json, write_json, DialResponse};
use agentgate_transport::{memory_pipe, AsyncReadWrite, BoxedIo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{BrokerError, BrokerResult};

/// First message on a relay connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayHello {
    pub allocation: Uuid,
}

/// Parameters for dialing the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRequest {
    /// Shared by both peers of a negotiation
    pub allocation: Uuid,
    /// Address of the original caller, used for quota accounting
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Opens a connection to the relay
#[async_trait]
pub trait RelayDialer: Send + Sync {
    async fn dial(&self, request: RelayRequest) -> BrokerResult<BoxedIo>;
}

/// Write the hello and wait for the allocation to be accepted
async fn handshake(io: &mut BoxedIo, allocation: Uuid) -> BrokerResult<()> {
    write_json(io, &RelayHello { allocation }).await?;
    let response: DialResponse = read_json(io).await?;
    if !response.is_ok() {
        return Err(BrokerError::Relay(response.error));
    }
    Ok(())
}

/// Dials a [`RelayServer`] in the same process through an in-memory pipe
#[derive(Clone)]
pub struct PipeRelayDialer {
    server: RelayServer,
}

impl PipeRelayDialer {
    pub fn new(server: RelayServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl RelayDialer for PipeRelayDialer {
    async fn dial(&self, request: RelayRequest) -> BrokerResult<BoxedIo> {
        let (client, server_side) = memory_pipe();

        let server = self.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server
                .accept(server_side, request.remote_addr, request.local_addr)
                .await
            {
                debug!(allocation = %request.allocation, "Relay connection ended: {}", e);
            }
        });

        let mut io: BoxedIo = Box::new(client);
        handshake(&mut io, request.allocation).await?;
        Ok(io)
    }
}

/// Dials a relay listening on a TCP address
#[derive(Debug, Clone)]
pub struct TcpRelayDialer {
    address: SocketAddr,
}

impl TcpRelayDialer {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }
}

#[async_trait]
impl RelayDialer for TcpRelayDialer {
    async fn dial(&self, request: RelayRequest) -> BrokerResult<BoxedIo> {
        let stream = TcpStream::connect(self.address).await?;
        stream.set_nodelay(true)?;

        let mut io: BoxedIo = Box::new(stream);
        handshake(&mut io, request.allocation).await?;
        Ok(io)
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Concurrent allocations allowed per remote IP
    pub max_allocations_per_ip: usize,
    /// How long the first peer waits for the second
    pub pairing_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_allocations_per_ip: 8,
            pairing_timeout: Duration::from_secs(30),
        }
    }
}

struct RelayPeer {
    io: BoxedIo,
    _allocation: AllocationGuard,
}

struct RelayInner {
    config: RelayConfig,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<RelayPeer>>>,
    allocations: Mutex<HashMap<IpAddr, usize>>,
}

/// Releases an allocation slot when dropped
struct AllocationGuard {
    inner: Arc<RelayInner>,
    ip: IpAddr,
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        if let Ok(mut allocations) = self.inner.allocations.lock() {
            if let Some(count) = allocations.get_mut(&self.ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    allocations.remove(&self.ip);
                }
            }
        }
    }
}

enum Pairing {
    First(oneshot::Receiver<RelayPeer>),
    Second(oneshot::Sender<RelayPeer>),
}

/// Pairs relay connections by allocation id
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<RelayInner>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config,
                pending: Mutex::new(HashMap::new()),
                allocations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Active allocations held by `ip`
    pub fn allocations(&self, ip: IpAddr) -> usize {
        self.inner
            .allocations
            .lock()
            .ok()
            .and_then(|a| a.get(&ip).copied())
            .unwrap_or(0)
    }

    fn allocate(&self, ip: IpAddr) -> BrokerResult<AllocationGuard> {
        let mut allocations = self
            .inner
            .allocations
            .lock()
            .map_err(|_| BrokerError::Relay("allocation table poisoned".to_string()))?;

        let count = allocations.entry(ip).or_insert(0);
        if *count >= self.inner.config.max_allocations_per_ip {
            return Err(BrokerError::QuotaExceeded(ip));
        }
        *count += 1;

        Ok(AllocationGuard {
            inner: self.inner.clone(),
            ip,
        })
    }

    fn pair(&self, allocation: Uuid) -> BrokerResult<Pairing> {
        let mut pending = self
            .inner
            .pending
            .lock()
            .map_err(|_| BrokerError::Relay("pending table poisoned".to_string()))?;

        if let Some(tx) = pending.remove(&allocation) {
            return Ok(Pairing::Second(tx));
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(allocation, tx);
        Ok(Pairing::First(rx))
    }

    fn forget(&self, allocation: &Uuid) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(allocation);
        }
    }

    /// Serve one relay connection
    ///
    /// The first connection of an allocation waits for its peer and then
    /// copies bytes until either side closes. The second hands its
    /// connection over and returns immediately.
    pub async fn accept<T>(&self, io: T, remote: SocketAddr, local: SocketAddr) -> BrokerResult<()>
    where
        T: AsyncReadWrite + 'static,
    {
        let mut io: BoxedIo = Box::new(io);
        let hello: RelayHello = read_json(&mut io).await?;
        let allocation = hello.allocation;

        let guard = match self.allocate(remote.ip()) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(allocation = %allocation, remote = %remote, "Rejecting relay allocation: {}", e);
                let _ = write_json(&mut io, &DialResponse::failed(e.to_string())).await;
                return Err(e);
            }
        };
        write_json(&mut io, &DialResponse::ok()).await?;

        debug!(allocation = %allocation, remote = %remote, local = %local, "Relay allocation accepted");

        let peer = RelayPeer {
            io,
            _allocation: guard,
        };

        match self.pair(allocation)? {
            Pairing::Second(tx) => tx
                .send(peer)
                .map_err(|_| BrokerError::Relay("allocation expired".to_string())),
            Pairing::First(rx) => {
                let other = match tokio::time::timeout(self.inner.config.pairing_timeout, rx).await
                {
                    Ok(Ok(other)) => other,
                    Ok(Err(_)) => {
                        self.forget(&allocation);
                        return Err(BrokerError::Relay("allocation abandoned".to_string()));
                    }
                    Err(_) => {
                        self.forget(&allocation);
                        return Err(BrokerError::Relay(
                            "timed out waiting for relay peer".to_string(),
                        ));
                    }
                };

                info!(allocation = %allocation, "Relaying peer connection");
                let stats = bridge(peer.io, other.io).await;
                debug!(
                    allocation = %allocation,
                    a_to_b = stats.a_to_b,
                    b_to_a = stats.b_to_a,
                    "Relay closed"
                );
                Ok(())
            }
        }
    }

    /// Accept relay connections on a TCP listener until cancelled
    pub async fn listen(&self, listener: TcpListener, cancel: CancellationToken) -> BrokerResult<()> {
        let local = listener.local_addr()?;
        info!("Relay listening on {}", local);

        loop {
            let (stream, remote) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = cancel.cancelled() => return Ok(()),
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.accept(stream, remote, local).await {
                    debug!(remote = %remote, "Relay connection ended: {}", e);
                }
            });
        }
    }
}
