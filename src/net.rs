//! UDP implementations of the [`Transport`] abstraction.
//!
//! The DHT's direct RPCs are small single-datagram exchanges, which makes
//! UDP a good fit; fault tolerance is the gossip layer's job. Each outbound
//! call opens a fresh ephemeral socket, writes one request datagram, and
//! performs a single timed read for the reply.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::core::{DhtError, GroupRpc, HostAddr, Node, Transport};
use crate::protocol::{self, Request, MAX_DATAGRAM_SIZE};
use crate::server;

/// Default deadline for the single response read of an outbound RPC.
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// UDP-based [`Transport`].
///
/// Constructed with a bound socket it both issues outbound RPCs and, once
/// [`register`](Transport::register)ed, serves inbound ones. Constructed
/// with [`client`](Self::client) it only issues outbound RPCs and is not a
/// cluster member.
pub struct UdpTransport {
    socket: Option<Arc<UdpSocket>>,
    local_host: Option<String>,
    rpc_timeout: Duration,
}

impl UdpTransport {
    /// Transport serving on the given socket.
    pub fn new(socket: UdpSocket) -> Self {
        let local_host = socket.local_addr().ok().map(|addr| addr.to_string());
        Self {
            socket: Some(Arc::new(socket)),
            local_host,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Client-only transport; [`register`](Transport::register) is a no-op.
    pub fn client() -> Self {
        Self {
            socket: None,
            local_host: None,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Override the per-call response deadline.
    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    /// One request datagram out, one response datagram back.
    async fn call(&self, host: &str, request: &Request) -> Result<Vec<u8>, DhtError> {
        let target: SocketAddr = host
            .parse()
            .map_err(|_| DhtError::Transport(format!("invalid peer address: {host}")))?;
        let bind: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|err| DhtError::Transport(err.to_string()))?;
        socket
            .send_to(&request.encode(), target)
            .await
            .map_err(|err| DhtError::Transport(err.to_string()))?;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let len = timeout(self.rpc_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| DhtError::Transport(format!("no response from {host}")))?
            .map_err(|err| DhtError::Transport(err.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn call_nodes(&self, host: &str, request: &Request) -> Result<Vec<Node>, DhtError> {
        protocol::decode_response(&self.call(host, request).await?)
    }

    async fn call_ack(&self, host: &str, request: &Request) -> Result<(), DhtError> {
        protocol::decode_response(&self.call(host, request).await?).map(|_| ())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn lookup(&self, host: &str, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        self.call_nodes(host, &Request::Lookup { key: key.to_vec() })
            .await
    }

    async fn lookup_nodes(
        &self,
        host: &str,
        key: &[u8],
        min: usize,
    ) -> Result<Vec<Node>, DhtError> {
        let min = u16::try_from(min).unwrap_or(u16::MAX);
        self.call_nodes(
            host,
            &Request::LookupNodes {
                min,
                key: key.to_vec(),
            },
        )
        .await
    }

    async fn lookup_group_nodes(&self, host: &str, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        self.call_nodes(host, &Request::LookupGroupNodes { key: key.to_vec() })
            .await
    }

    async fn insert(
        &self,
        host: &str,
        key: &[u8],
        tuple: HostAddr,
        propagate: bool,
    ) -> Result<(), DhtError> {
        self.call_ack(
            host,
            &Request::Insert {
                propagate,
                tuple,
                key: key.to_vec(),
            },
        )
        .await
    }

    async fn delete(
        &self,
        host: &str,
        key: &[u8],
        tuple: HostAddr,
        propagate: bool,
    ) -> Result<(), DhtError> {
        self.call_ack(
            host,
            &Request::Delete {
                propagate,
                tuple,
                key: key.to_vec(),
            },
        )
        .await
    }

    /// Time a small RPC against the node's own group.
    ///
    /// The node's address hashes into its own group, so the remote view is
    /// never empty for this key while the node is alive.
    async fn ping(&self, node: &Node) -> Duration {
        let host = node.host();
        if self.local_host.as_deref() == Some(host.as_str()) {
            return Duration::ZERO;
        }

        let start = Instant::now();
        match self
            .lookup_group_nodes(&host, node.addr.as_bytes())
            .await
        {
            Ok(_) => start.elapsed(),
            Err(err) => {
                debug!(%err, host = %host, "ping skipped");
                Duration::ZERO
            }
        }
    }

    fn register(&self, rpc: Arc<dyn GroupRpc>) {
        match &self.socket {
            Some(socket) => {
                if let Ok(addr) = socket.local_addr() {
                    info!(%addr, "dht serving");
                }
                tokio::spawn(server::serve(socket.clone(), rpc));
            }
            None => warn!("client-only transport; ignoring rpc registration"),
        }
    }
}

/// Thin client for talking to an existing cluster.
///
/// Issues requests against the configured peers in round-robin order;
/// writes are sent with propagation enabled so the receiving member fans
/// them out within the owning group.
pub struct UdpClient {
    trans: UdpTransport,
    peers: Vec<String>,
    next: AtomicUsize,
}

impl UdpClient {
    /// Client over the given peers. At least one peer is required.
    pub fn new(peers: Vec<String>) -> Result<Self, DhtError> {
        if peers.is_empty() {
            return Err(DhtError::InvalidRequest(
                "at least one peer required".to_string(),
            ));
        }
        Ok(Self {
            trans: UdpTransport::client(),
            peers,
            next: AtomicUsize::new(0),
        })
    }

    fn peer(&self) -> &str {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        &self.peers[idx % self.peers.len()]
    }

    /// Resolve the nodes holding a key.
    pub async fn lookup(&self, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        self.trans.lookup(self.peer(), key).await
    }

    /// Request at least `min` nodes for a key.
    pub async fn lookup_nodes(&self, key: &[u8], min: usize) -> Result<Vec<Node>, DhtError> {
        self.trans.lookup_nodes(self.peer(), key, min).await
    }

    /// Request the members of the key's owning group.
    pub async fn lookup_group_nodes(&self, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        self.trans.lookup_group_nodes(self.peer(), key).await
    }

    /// Insert a key-to-endpoint mapping through a peer.
    pub async fn insert(&self, key: &[u8], tuple: HostAddr) -> Result<(), DhtError> {
        self.trans.insert(self.peer(), key, tuple, true).await
    }

    /// Delete a key-to-endpoint mapping through a peer.
    pub async fn delete(&self, key: &[u8], tuple: HostAddr) -> Result<(), DhtError> {
        self.trans.delete(self.peer(), key, tuple, true).await
    }
}
