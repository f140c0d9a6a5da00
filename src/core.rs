//! Core DHT logic: transport-agnostic affinity-group routing and storage.
//!
//! This module contains the fundamental building blocks of the DHT:
//!
//! - **Identity & Hashing**: [`HostAddr`], [`NodeId`], the pluggable
//!   [`KeyHasher`] and its default [`Sha256Hasher`]
//! - **Partitioning**: [`AffinityGroups`], the fixed keyspace cover, and
//!   [`AffinityGroup`], the per-group membership view
//! - **Storage**: the [`TupleStore`] trait and the in-memory [`InmemTuples`]
//! - **Routing**: [`KelipsNode`], which resolves local vs foreign operations
//!   and forwards to the owning group over the [`Transport`]
//! - **Propagation**: a background task replaying writes to the remaining
//!   members of the owning group

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::events::Broadcaster;

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the DHT core and its collaborators.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DhtError {
    /// The requested node is not in the membership view.
    #[error("node not found")]
    NodeNotFound,
    /// A node with the same host is already in the view.
    #[error("node exists")]
    NodeExists,
    /// The key is not in the tuple store.
    #[error("key not found")]
    KeyNotFound,
    /// The owning group and the rest of the ring hold no members to forward to.
    #[error("no candidate nodes")]
    NoCandidateNodes,
    /// A wire payload was too short or otherwise malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A remote call failed; carries the remote error text.
    #[error("transport: {0}")]
    Transport(String),
    /// Serialisation or other unexpected failure.
    #[error("internal: {0}")]
    Internal(String),
}

// ============================================================================
// Identity & Hashing
// ============================================================================

/// Hash of a node's [`HostAddr`], identifying it in the keyspace.
///
/// For a given hash function the id is a pure function of the address.
pub type NodeId = Vec<u8>;

/// Digest function used to place keys and nodes in the keyspace.
///
/// The output width determines the keyspace size `2^(8 * output_size)`.
pub trait KeyHasher: Send + Sync {
    /// Compute the digest of the input.
    fn digest(&self, data: &[u8]) -> Vec<u8>;

    /// Digest width in bytes.
    fn output_size(&self) -> usize;
}

/// Default [`KeyHasher`] producing 32-byte SHA-256 digests.
///
/// ```
/// use kelips_dht::{KeyHasher, Sha256Hasher};
///
/// let hasher = Sha256Hasher;
/// let digest = hasher.digest(b"foo");
/// assert_eq!(digest.len(), hasher.output_size());
/// // The same input always produces the same digest.
/// assert_eq!(digest, hasher.digest(b"foo"));
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Hasher;

impl KeyHasher for Sha256Hasher {
    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn output_size(&self) -> usize {
        32
    }
}

// ============================================================================
// Host Addresses
// ============================================================================

/// Wire width of a [`HostAddr`]: 16 IP bytes plus a big-endian port.
pub const HOST_ADDR_LEN: usize = 18;

/// Fixed-width endpoint identifier: 16 IP bytes followed by the port.
///
/// IPv4 addresses are left-padded with 12 zero bytes to the IPv6 width.
/// Equality and hashing are byte-wise. The all-zero value acts as the
/// "whole key" sentinel in delete requests.
///
/// ```
/// use kelips_dht::{HostAddr, HOST_ADDR_LEN};
///
/// let addr: HostAddr = "127.0.0.1:54540".parse().unwrap();
/// assert_eq!(addr.as_bytes().len(), HOST_ADDR_LEN);
/// assert_eq!(addr.to_string(), "127.0.0.1:54540");
/// assert_eq!(HostAddr::from_bytes(addr.as_bytes()).unwrap(), addr);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddr([u8; HOST_ADDR_LEN]);

impl HostAddr {
    /// Build an address from an IP and port.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let mut buf = [0u8; HOST_ADDR_LEN];
        match ip {
            IpAddr::V4(v4) => buf[12..16].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => buf[..16].copy_from_slice(&v6.octets()),
        }
        buf[16..].copy_from_slice(&port.to_be_bytes());
        Self(buf)
    }

    /// Decode an address from its 18-byte wire form.
    pub fn from_bytes(b: &[u8]) -> Result<Self, DhtError> {
        if b.len() != HOST_ADDR_LEN {
            return Err(DhtError::InvalidRequest(format!(
                "host address must be {HOST_ADDR_LEN} bytes, got {}",
                b.len()
            )));
        }
        let mut buf = [0u8; HOST_ADDR_LEN];
        buf.copy_from_slice(b);
        Ok(Self(buf))
    }

    /// The 18-byte wire form.
    pub fn as_bytes(&self) -> &[u8; HOST_ADDR_LEN] {
        &self.0
    }

    /// The IP portion. The 12-zero-byte prefix is read back as IPv4.
    pub fn ip(&self) -> IpAddr {
        if self.0[..12].iter().all(|b| *b == 0) {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&self.0[12..16]);
            IpAddr::V4(Ipv4Addr::from(octets))
        } else {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&self.0[..16]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }

    /// The port portion.
    pub fn port(&self) -> u16 {
        u16::from_be_bytes([self.0[16], self.0[17]])
    }

    /// All-zero address, used as the whole-key sentinel in deletes.
    pub fn unspecified() -> Self {
        Self([0u8; HOST_ADDR_LEN])
    }

    /// Whether this is the all-zero sentinel.
    pub fn is_unspecified(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// The address as a standard socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port())
    }
}

impl From<SocketAddr> for HostAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for HostAddr {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s
            .parse()
            .map_err(|_| DhtError::InvalidRequest(format!("invalid host address: {s}")))?;
        Ok(Self::from(addr))
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.socket_addr(), f)
    }
}

impl fmt::Debug for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostAddr({self})")
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// Membership record for a peer, materialised from gossip events.
///
/// `id`, `addr`, `name` and `meta` are fixed once the node is inserted;
/// the liveness fields (`heartbeats`, `rtt`, `last_seen`) are updated by
/// ping observations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Hash id of the node address.
    pub id: NodeId,
    /// Endpoint the node serves on.
    pub addr: HostAddr,
    /// Gossip-layer name, if any.
    pub name: String,
    /// Gossip-layer tags.
    pub tags: HashMap<String, String>,
    /// Opaque metadata (`k1=v1,k2=v2` by convention).
    pub meta: Vec<u8>,
    /// Number of heartbeats received.
    pub heartbeats: u64,
    /// Round-trip time to the node.
    pub rtt: Duration,
    /// Last time contact was made.
    pub last_seen: SystemTime,
    /// Topology tags.
    pub region: String,
    /// Topology tags.
    pub sector: String,
    /// Topology tags.
    pub zone: String,
}

impl Node {
    /// Fresh record for the given endpoint. The id is assigned on insertion.
    pub fn new(addr: HostAddr) -> Self {
        Self {
            id: NodeId::new(),
            addr,
            name: String::new(),
            tags: HashMap::new(),
            meta: Vec::new(),
            heartbeats: 0,
            rtt: Duration::ZERO,
            last_seen: SystemTime::now(),
            region: String::new(),
            sector: String::new(),
            zone: String::new(),
        }
    }

    /// The `ip:port` string the membership views key on.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }
}

// ============================================================================
// Affinity Groups
// ============================================================================

/// A partial view of the nodes belonging to one affinity group.
///
/// The view is keyed by the `ip:port` string and guarded by a single
/// reader/writer lock. [`nodes`](Self::nodes) returns a point-in-time copy
/// sorted by host string so iteration order is deterministic.
pub struct AffinityGroup {
    // id constructed by dividing the hash keyspace by the group count
    id: Vec<u8>,
    index: usize,
    members: RwLock<HashMap<String, Node>>,
}

impl AffinityGroup {
    fn new(id: Vec<u8>, index: usize) -> Self {
        Self {
            id,
            index,
            members: RwLock::new(HashMap::new()),
        }
    }

    /// The group's keyspace id.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// The group's position in the ring.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of known members.
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// Whether the view holds no members.
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Look up a member by its host string.
    pub fn get(&self, host: &str) -> Option<Node> {
        self.members.read().get(host).cloned()
    }

    /// Point-in-time copy of the members, sorted by host string.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.members.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.host().cmp(&b.host()));
        nodes
    }

    pub(crate) fn add_node(&self, mut node: Node, force: bool) -> Result<(), DhtError> {
        let host = node.host();
        let mut members = self.members.write();
        let fresh = !members.contains_key(&host);
        if !fresh && !force {
            return Err(DhtError::NodeExists);
        }
        node.last_seen = SystemTime::now();
        if fresh {
            node.heartbeats = 1;
        }
        members.insert(host.clone(), node);
        let count = members.len();
        drop(members);

        info!(group = self.index, count, host = %host, "node added");
        Ok(())
    }

    pub(crate) fn remove_node(&self, host: &str) -> Result<(), DhtError> {
        let mut members = self.members.write();
        if members.remove(host).is_none() {
            return Err(DhtError::NodeNotFound);
        }
        let count = members.len();
        drop(members);

        info!(group = self.index, count, host = %host, "node removed");
        Ok(())
    }

    /// Record a ping observation: bump heartbeats, refresh rtt and last seen.
    pub(crate) fn ping_node(&self, host: &str, rtt: Duration) -> Result<(), DhtError> {
        let mut members = self.members.write();
        let node = members.get_mut(host).ok_or(DhtError::NodeNotFound)?;
        node.heartbeats += 1;
        node.last_seen = SystemTime::now();
        node.rtt = rtt;
        Ok(())
    }

    /// Refresh liveness for every member via the transport.
    ///
    /// A zero round-trip time means "no update this round".
    pub(crate) async fn check_nodes<T: Transport>(&self, transport: &T) {
        for node in self.nodes() {
            let rtt = transport.ping(&node).await;
            if rtt.is_zero() {
                continue;
            }
            let _ = self.ping_node(&node.host(), rtt);
        }
    }
}

/// The ordered set of affinity groups covering the keyspace.
///
/// Constructed once at node startup from the group count and the digest
/// width; immutable thereafter. Group ids satisfy
/// `groups[i].id < groups[i+1].id` with `groups[0].id` all zeros.
pub struct AffinityGroups {
    groups: Vec<Arc<AffinityGroup>>,
}

impl AffinityGroups {
    /// Generate `num_groups` groups over a `2^(8 * hash_size)` keyspace.
    ///
    /// Group `i` gets id `i * floor(keyspace / num_groups)` serialised as
    /// minimal big-endian bytes (group 0 is `hash_size` zero bytes).
    pub fn generate(num_groups: usize, hash_size: usize) -> Self {
        assert!(num_groups > 0, "at least one affinity group required");
        let stride = keyspace_stride(num_groups, hash_size);
        let mut groups = Vec::with_capacity(num_groups);
        groups.push(Arc::new(AffinityGroup::new(vec![0u8; hash_size], 0)));
        for i in 1..num_groups {
            groups.push(Arc::new(AffinityGroup::new(mul_bytes(&stride, i), i)));
        }
        Self { groups }
    }

    /// Number of groups in the ring.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether the ring holds no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The groups in ring order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AffinityGroup>> {
        self.groups.iter()
    }

    /// The owning group for a hash id: the largest group whose id is not
    /// greater than `id`, found by binary search over the ordered ids.
    pub fn get(&self, id: &[u8]) -> Arc<AffinityGroup> {
        let idx = match self
            .groups
            .binary_search_by(|group| group.id.as_slice().cmp(id))
        {
            Ok(idx) => idx,
            Err(idx) => idx.saturating_sub(1),
        };
        self.groups[idx].clone()
    }

    /// Walk the ring circularly from `from` and return the first group with
    /// a non-empty view, or `None` when the full ring is empty.
    pub fn next_closest_nonempty(&self, from: &AffinityGroup) -> Option<Arc<AffinityGroup>> {
        let mut idx = from.index();
        loop {
            idx = (idx + 1) % self.groups.len();
            let group = &self.groups[idx];
            if !group.is_empty() {
                return Some(group.clone());
            }
            if idx == from.index() {
                return None;
            }
        }
    }

    /// Total number of nodes across all views.
    pub fn node_count(&self) -> usize {
        self.groups.iter().map(|group| group.len()).sum()
    }

    /// Iterate over all nodes in all groups. Returning `false` stops early.
    pub fn iter_nodes(&self, mut f: impl FnMut(Node) -> bool) {
        for group in &self.groups {
            for node in group.nodes() {
                if !f(node) {
                    return;
                }
            }
        }
    }

    pub(crate) async fn check_nodes<T: Transport>(&self, transport: &T) {
        for group in &self.groups {
            group.check_nodes(transport).await;
        }
    }
}

/// `floor(2^(8 * hash_size) / num_groups)` as minimal big-endian bytes.
///
/// Byte-wise long division; the dividend is a one followed by `hash_size`
/// zero bytes.
fn keyspace_stride(num_groups: usize, hash_size: usize) -> Vec<u8> {
    let divisor = num_groups as u64;
    let mut quotient = Vec::with_capacity(hash_size + 1);
    let mut rem: u64 = 0;

    for pos in 0..=hash_size {
        let digit: u64 = if pos == 0 { 1 } else { 0 };
        let acc = rem * 256 + digit;
        quotient.push((acc / divisor) as u8);
        rem = acc % divisor;
    }

    trim_leading_zeros(quotient)
}

/// Multiply big-endian bytes by a small factor.
fn mul_bytes(value: &[u8], factor: usize) -> Vec<u8> {
    let factor = factor as u64;
    let mut out = vec![0u8; value.len()];
    let mut carry: u64 = 0;

    for (i, b) in value.iter().enumerate().rev() {
        let acc = u64::from(*b) * factor + carry;
        out[i] = (acc & 0xff) as u8;
        carry = acc >> 8;
    }
    while carry > 0 {
        out.insert(0, (carry & 0xff) as u8);
        carry >>= 8;
    }

    trim_leading_zeros(out)
}

fn trim_leading_zeros(mut bytes: Vec<u8>) -> Vec<u8> {
    let nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes.drain(..nonzero);
    bytes
}

// ============================================================================
// Tuple Store
// ============================================================================

/// Mapping from keys to the endpoints holding them.
///
/// Implementations must compare [`HostAddr`] values byte-wise and must not
/// store duplicate tuples for the same key.
pub trait TupleStore: Send + Sync {
    /// Add a host for a key. Idempotent: re-inserting an existing
    /// (key, host) pair is a no-op.
    fn insert(&self, key: &[u8], host: HostAddr) -> Result<(), DhtError>;

    /// The ordered hosts for a key, or [`DhtError::KeyNotFound`].
    fn get(&self, key: &[u8]) -> Result<Vec<HostAddr>, DhtError>;

    /// Remove a key and all its hosts, or [`DhtError::KeyNotFound`].
    fn delete(&self, key: &[u8]) -> Result<(), DhtError>;

    /// Remove one host from one key. Returns `true` iff it was present.
    fn delete_key_host(&self, key: &[u8], host: &HostAddr) -> bool;

    /// Remove a host from every key referencing it. Returns `true` iff at
    /// least one reference was removed.
    fn expire_host(&self, host: &HostAddr) -> bool;

    /// Snapshot iteration over all entries. Returning `false` stops early.
    fn iter(&self, f: &mut dyn FnMut(&[u8], &[HostAddr]) -> bool);

    /// Number of keys (not tuples) in the store.
    fn count(&self) -> usize;
}

/// In-memory [`TupleStore`] behind a single reader/writer lock.
#[derive(Default)]
pub struct InmemTuples {
    m: RwLock<HashMap<Vec<u8>, Vec<HostAddr>>>,
}

impl InmemTuples {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TupleStore for InmemTuples {
    fn insert(&self, key: &[u8], host: HostAddr) -> Result<(), DhtError> {
        let mut m = self.m.write();
        let hosts = m.entry(key.to_vec()).or_default();
        if !hosts.contains(&host) {
            hosts.push(host);
            debug!(key = %hex::encode(key), host = %host, "tuple added");
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<HostAddr>, DhtError> {
        self.m.read().get(key).cloned().ok_or(DhtError::KeyNotFound)
    }

    fn delete(&self, key: &[u8]) -> Result<(), DhtError> {
        match self.m.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(DhtError::KeyNotFound),
        }
    }

    fn delete_key_host(&self, key: &[u8], host: &HostAddr) -> bool {
        let mut m = self.m.write();
        let Some(hosts) = m.get_mut(key) else {
            return false;
        };
        match hosts.iter().position(|h| h == host) {
            Some(idx) => {
                hosts.remove(idx);
                debug!(key = %hex::encode(key), host = %host, "tuple deleted");
                true
            }
            None => false,
        }
    }

    fn expire_host(&self, host: &HostAddr) -> bool {
        let mut removed = false;
        let mut m = self.m.write();
        for (key, hosts) in m.iter_mut() {
            // insert() never duplicates, so one occurrence per key at most
            if let Some(idx) = hosts.iter().position(|h| h == host) {
                hosts.remove(idx);
                debug!(key = %hex::encode(key), host = %host, "tuple expired");
                removed = true;
            }
        }
        removed
    }

    fn iter(&self, f: &mut dyn FnMut(&[u8], &[HostAddr]) -> bool) {
        let m = self.m.read();
        for (key, hosts) in m.iter() {
            if !f(key, hosts) {
                break;
            }
        }
    }

    fn count(&self) -> usize {
        self.m.read().len()
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// RPCs the network transport serves out of the local node.
///
/// The transport hands inbound requests to the registered implementation;
/// the in-memory test transport calls it directly.
#[async_trait]
pub trait GroupRpc: Send + Sync + 'static {
    /// Resolve the nodes holding a key from the local view.
    async fn lookup(&self, key: &[u8]) -> Result<Vec<Node>, DhtError>;

    /// Accumulate at least `min` nodes starting from the key's owning group.
    async fn lookup_nodes(&self, key: &[u8], min: usize) -> Result<Vec<Node>, DhtError>;

    /// All members of the key's owning group.
    async fn lookup_group_nodes(&self, key: &[u8]) -> Result<Vec<Node>, DhtError>;

    /// Store a (key, tuple) pair locally, fanning out within the group when
    /// `propagate` is set.
    async fn insert(&self, key: &[u8], tuple: HostAddr, propagate: bool) -> Result<(), DhtError>;

    /// Remove a (key, tuple) pair locally; the all-zero tuple removes the
    /// whole key. Fans out within the group when `propagate` is set.
    async fn delete(&self, key: &[u8], tuple: HostAddr, propagate: bool) -> Result<(), DhtError>;
}

/// Network abstraction for the DHT's direct RPCs.
///
/// Abstracts the datagram layer so the core works with different
/// implementations (UDP in production, an in-memory registry in tests).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Ask `host` to resolve the nodes holding `key`.
    async fn lookup(&self, host: &str, key: &[u8]) -> Result<Vec<Node>, DhtError>;

    /// Ask `host` for at least `min` nodes for `key`.
    async fn lookup_nodes(&self, host: &str, key: &[u8], min: usize)
        -> Result<Vec<Node>, DhtError>;

    /// Ask `host` for the members of `key`'s owning group.
    async fn lookup_group_nodes(&self, host: &str, key: &[u8]) -> Result<Vec<Node>, DhtError>;

    /// Forward an insert to `host`.
    async fn insert(
        &self,
        host: &str,
        key: &[u8],
        tuple: HostAddr,
        propagate: bool,
    ) -> Result<(), DhtError>;

    /// Forward a delete to `host`.
    async fn delete(
        &self,
        host: &str,
        key: &[u8],
        tuple: HostAddr,
        propagate: bool,
    ) -> Result<(), DhtError>;

    /// Measure the round-trip time to a node.
    ///
    /// Returns [`Duration::ZERO`] for self or when no measurement could be
    /// taken this round.
    async fn ping(&self, node: &Node) -> Duration;

    /// Register the local RPC handler and start serving inbound requests.
    fn register(&self, rpc: Arc<dyn GroupRpc>);
}

// ============================================================================
// Local Group RPC
// ============================================================================

/// Depth of the propagation queue. Producers block when it is full.
const PROPAGATION_QUEUE_DEPTH: usize = 32;

#[derive(Clone, Copy, Debug)]
enum PropOp {
    Insert,
    Delete,
}

struct PropReq {
    op: PropOp,
    key: Vec<u8>,
    tuple: HostAddr,
}

/// The local node's side of the DHT: serves [`GroupRpc`] requests against
/// the tuple store and enqueues propagation work.
pub(crate) struct LocalGroup {
    local: Node,
    idx: usize,
    hasher: Arc<dyn KeyHasher>,
    tuples: Arc<dyn TupleStore>,
    groups: Arc<AffinityGroups>,
    prop_tx: Option<mpsc::Sender<PropReq>>,
}

impl LocalGroup {
    fn owning_group(&self, key: &[u8]) -> Arc<AffinityGroup> {
        self.groups.get(&self.hasher.digest(key))
    }

    /// Store a gossiped tuple only when the key belongs to the local group.
    pub(crate) fn add_tuple(&self, key: &[u8], host: HostAddr) -> bool {
        let group = self.owning_group(key);
        if group.index() != self.idx {
            return false;
        }
        self.tuples.insert(key, host).is_ok()
    }

    /// Resolve the stored tuples for a key into known nodes.
    ///
    /// Each tuple is hashed to its owning group and looked up in that view;
    /// tuples whose node is not (yet) known are omitted.
    pub(crate) fn tuple_nodes(&self, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        let hosts = self.tuples.get(key)?;
        let mut nodes = Vec::with_capacity(hosts.len());
        for host in hosts {
            let group = self.groups.get(&self.hasher.digest(host.as_bytes()));
            if let Some(node) = group.get(&host.to_string()) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    fn walk_nodes(&self, key: &[u8], min: usize) -> Result<Vec<Node>, DhtError> {
        let start = self.owning_group(key);
        let mut nodes = start.nodes();
        let mut visited = vec![false; self.groups.len()];
        visited[start.index()] = true;

        let mut current = start;
        while nodes.len() < min {
            let next = match self.groups.next_closest_nonempty(&current) {
                Some(next) => next,
                None => return Err(DhtError::NodeNotFound),
            };
            if visited[next.index()] {
                return Err(DhtError::NodeNotFound);
            }
            visited[next.index()] = true;
            nodes.extend(next.nodes());
            current = next;
        }
        Ok(nodes)
    }

    async fn enqueue(&self, op: PropOp, key: &[u8], tuple: HostAddr) {
        let Some(tx) = &self.prop_tx else {
            return;
        };
        let req = PropReq {
            op,
            key: key.to_vec(),
            tuple,
        };
        if tx.send(req).await.is_err() {
            debug!("propagator unavailable; dropping request");
        }
    }
}

#[async_trait]
impl GroupRpc for LocalGroup {
    async fn lookup(&self, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        self.tuple_nodes(key)
    }

    async fn lookup_nodes(&self, key: &[u8], min: usize) -> Result<Vec<Node>, DhtError> {
        self.walk_nodes(key, min)
    }

    async fn lookup_group_nodes(&self, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        Ok(self.owning_group(key).nodes())
    }

    async fn insert(&self, key: &[u8], tuple: HostAddr, propagate: bool) -> Result<(), DhtError> {
        self.tuples.insert(key, tuple)?;
        if propagate {
            self.enqueue(PropOp::Insert, key, tuple).await;
        }
        Ok(())
    }

    async fn delete(&self, key: &[u8], tuple: HostAddr, propagate: bool) -> Result<(), DhtError> {
        if tuple.is_unspecified() {
            self.tuples.delete(key)?;
            if propagate {
                self.enqueue(PropOp::Delete, key, tuple).await;
            }
            return Ok(());
        }

        let removed = self.tuples.delete_key_host(key, &tuple);
        if removed && propagate {
            self.enqueue(PropOp::Delete, key, tuple).await;
        }
        Ok(())
    }
}

/// Drain the propagation queue, replaying each write to the remaining
/// members of the key's owning group with propagation disabled.
///
/// Best-effort and unordered: per-peer failures are logged and never
/// retried; convergence of missed writes is left to the gossip layer.
async fn run_propagator<T: Transport>(
    mut reqs: mpsc::Receiver<PropReq>,
    groups: Arc<AffinityGroups>,
    hasher: Arc<dyn KeyHasher>,
    transport: Arc<T>,
    local_host: String,
) {
    while let Some(req) = reqs.recv().await {
        let group = groups.get(&hasher.digest(&req.key));
        for node in group.nodes() {
            let host = node.host();
            if host == local_host {
                continue;
            }
            let res = match req.op {
                PropOp::Insert => transport.insert(&host, &req.key, req.tuple, false).await,
                PropOp::Delete => transport.delete(&host, &req.key, req.tuple, false).await,
            };
            if let Err(err) = res {
                error!(%err, host = %host, key = %hex::encode(&req.key), "propagation failed");
            }
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a [`KelipsNode`].
#[derive(Clone)]
pub struct Config {
    /// `ip:port` identity used for hashing and serving. Required.
    pub advertise_host: String,
    /// Number of affinity groups. Optimally `sqrt(n)` for an estimated
    /// cluster size of `n`. Fixed at cluster birth.
    pub num_groups: usize,
    /// Whether writes fan out to the remaining members of the owning group.
    pub enable_propagation: bool,
    /// Interval at which member round-trip times are refreshed.
    pub heartbeat_interval: Duration,
    /// Digest used for keyspace placement.
    pub hasher: Arc<dyn KeyHasher>,
    /// Topology tag.
    pub region: String,
    /// Topology tag.
    pub sector: String,
    /// Topology tag.
    pub zone: String,
    /// Key/value metadata serialised into the local node record.
    pub meta: HashMap<String, String>,
    /// Tuple store override; defaults to [`InmemTuples`].
    pub tuple_store: Option<Arc<dyn TupleStore>>,
}

impl Config {
    /// Minimum required configuration with sane defaults.
    pub fn new(advertise_host: &str) -> Self {
        Self {
            advertise_host: advertise_host.to_string(),
            num_groups: 2,
            enable_propagation: true,
            heartbeat_interval: Duration::from_secs(30),
            hasher: Arc::new(Sha256Hasher),
            region: "region1".to_string(),
            sector: "sector1".to_string(),
            zone: "zone1".to_string(),
            meta: HashMap::new(),
            tuple_store: None,
        }
    }

    /// Serialise the metadata map as `k1=v1,k2=v2` with sorted keys.
    fn meta_bytes(&self) -> Vec<u8> {
        if self.meta.is_empty() {
            return Vec::new();
        }
        let mut pairs: Vec<String> = self
            .meta
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        pairs.sort();
        pairs.join(",").into_bytes()
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// One key and the endpoints holding it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TupleEntry {
    /// The opaque key.
    pub key: Vec<u8>,
    /// Endpoints holding the key, in insertion order.
    pub hosts: Vec<HostAddr>,
}

/// Full-state export of a node: group count, membership union, and every
/// tuple. Used to seed fresh nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// Number of affinity groups the node was built with.
    pub groups: u32,
    /// Union of all membership views.
    pub nodes: Vec<Node>,
    /// Full tuple store contents.
    pub tuples: Vec<TupleEntry>,
}

// ============================================================================
// DHT Node
// ============================================================================

/// The core engine of the DHT.
///
/// A `KelipsNode` owns the group table, the tuple store, and the
/// [`Transport`] used to reach foreign groups. The gossip layer is not part
/// of the implementation; membership and broadcast events are fed in
/// through [`handle_event`](Self::handle_event). The type is generic over
/// the transport so tests can use an in-memory mock while production uses
/// [`crate::net::UdpTransport`].
///
/// # Key Methods
///
/// * [`insert`](Self::insert) / [`delete`](Self::delete) - write a
///   key-to-endpoint mapping, forwarding to the owning group when foreign
/// * [`lookup`](Self::lookup) - resolve the nodes holding a key
/// * [`lookup_nodes`](Self::lookup_nodes) - accumulate a minimum number of
///   nodes walking the ring from the owning group
/// * [`add_node`](Self::add_node) / [`remove_node`](Self::remove_node) -
///   apply membership changes
/// * [`snapshot`](Self::snapshot) / [`seed`](Self::seed) - export and
///   reconstruct full state
///
/// The node is `Arc`-shared between the caller and its background tasks.
pub struct KelipsNode<T: Transport> {
    conf: Config,
    groups: Arc<AffinityGroups>,
    tuples: Arc<dyn TupleStore>,
    local: Arc<LocalGroup>,
    transport: Arc<T>,
    pub(crate) broadcaster: RwLock<Option<Arc<dyn Broadcaster>>>,
}

impl<T: Transport> KelipsNode<T> {
    /// Instantiate the node, register it with the transport, and spawn the
    /// propagator and health-checker tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create(conf: Config, transport: T) -> Result<Arc<Self>, DhtError> {
        if conf.num_groups == 0 {
            return Err(DhtError::InvalidRequest(
                "at least one affinity group required".to_string(),
            ));
        }
        let hasher = conf.hasher.clone();
        let groups = Arc::new(AffinityGroups::generate(
            conf.num_groups,
            hasher.output_size(),
        ));
        let tuples: Arc<dyn TupleStore> = match conf.tuple_store.clone() {
            Some(store) => store,
            None => Arc::new(InmemTuples::new()),
        };

        let addr: HostAddr = conf.advertise_host.parse()?;
        let mut local_node = Node::new(addr);
        local_node.id = hasher.digest(addr.as_bytes());
        local_node.name = conf.advertise_host.clone();
        local_node.region = conf.region.clone();
        local_node.sector = conf.sector.clone();
        local_node.zone = conf.zone.clone();
        local_node.meta = conf.meta_bytes();

        let local_group = groups.get(&local_node.id);
        local_group.add_node(local_node.clone(), true)?;

        let transport = Arc::new(transport);
        let prop_tx = if conf.enable_propagation {
            let (tx, rx) = mpsc::channel(PROPAGATION_QUEUE_DEPTH);
            tokio::spawn(run_propagator(
                rx,
                groups.clone(),
                hasher.clone(),
                transport.clone(),
                local_node.host(),
            ));
            Some(tx)
        } else {
            None
        };

        let local = Arc::new(LocalGroup {
            local: local_node.clone(),
            idx: local_group.index(),
            hasher,
            tuples: tuples.clone(),
            groups: groups.clone(),
            prop_tx,
        });
        transport.register(local.clone());

        info!(id = %hex::encode(&local_node.id[..8.min(local_node.id.len())]), "kelips node");
        info!(
            group = local_group.index(),
            of = conf.num_groups,
            id = %hex::encode(local_group.id()),
            "local affinity group"
        );

        let node = Arc::new(Self {
            conf,
            groups,
            tuples,
            local,
            transport,
            broadcaster: RwLock::new(None),
        });
        node.spawn_health_checker();
        Ok(node)
    }

    fn spawn_health_checker(self: &Arc<Self>) {
        let groups = self.groups.clone();
        let transport = self.transport.clone();
        let period = self.conf.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                groups.check_nodes(&*transport).await;
            }
        });
    }

    /// The node's own membership record, read back from its group view.
    pub fn local_node(&self) -> Node {
        let group = self.groups.get(&self.local.local.id);
        group
            .get(&self.local.local.host())
            .unwrap_or_else(|| self.local.local.clone())
    }

    /// The group table.
    pub fn groups(&self) -> &AffinityGroups {
        &self.groups
    }

    fn owning_group(&self, key: &[u8]) -> Arc<AffinityGroup> {
        self.groups.get(&self.conf.hasher.digest(key))
    }

    /// Candidate peers for forwarding an operation on a foreign group:
    /// the owning group's members, or the next closest non-empty group's
    /// when the owning view is empty.
    fn forward_candidates(&self, group: &AffinityGroup) -> Result<Vec<Node>, DhtError> {
        let nodes = group.nodes();
        if !nodes.is_empty() {
            return Ok(nodes);
        }
        match self.groups.next_closest_nonempty(group) {
            Some(next) => Ok(next.nodes()),
            None => Err(DhtError::NoCandidateNodes),
        }
    }

    /// Insert a key and associated endpoint tuple.
    ///
    /// If the key belongs to the local group the tuple is stored here and
    /// fanned out to the remaining members. Otherwise the insert is
    /// forwarded to a candidate in the owning group (the receiver becomes
    /// responsible for the fan-out); candidates are tried in order and the
    /// last error is returned when all fail.
    ///
    /// A tuple whose node is not yet known is still stored; it surfaces in
    /// lookups once gossip makes the node known.
    pub async fn insert(&self, key: &[u8], tuple: HostAddr) -> Result<(), DhtError> {
        let group = self.owning_group(key);
        if group.index() == self.local.idx {
            return self.local.insert(key, tuple, true).await;
        }

        let candidates = self.forward_candidates(&group)?;
        let mut last_err = DhtError::NoCandidateNodes;
        for node in &candidates {
            let host = node.host();
            match self.transport.insert(&host, key, tuple, true).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(%err, host = %host, "insert forward failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Delete a (key, tuple) pair; the all-zero tuple deletes the whole key.
    ///
    /// Locality and failover behave exactly like [`insert`](Self::insert).
    pub async fn delete(&self, key: &[u8], tuple: HostAddr) -> Result<(), DhtError> {
        let group = self.owning_group(key);
        if group.index() == self.local.idx {
            return self.local.delete(key, tuple, true).await;
        }

        let candidates = self.forward_candidates(&group)?;
        let mut last_err = DhtError::NoCandidateNodes;
        for node in &candidates {
            let host = node.host();
            match self.transport.delete(&host, key, tuple, true).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(%err, host = %host, "delete forward failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Delete a key and all its tuples.
    pub async fn delete_key(&self, key: &[u8]) -> Result<(), DhtError> {
        self.delete(key, HostAddr::unspecified()).await
    }

    /// Resolve the nodes holding a key.
    ///
    /// If the owning group is local the answer comes from the tuple store,
    /// translating each stored tuple through the membership views. Otherwise
    /// candidates in the owning group are tried in order and the first
    /// successful reply is returned.
    pub async fn lookup(&self, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        let group = self.owning_group(key);
        if group.index() == self.local.idx {
            return self.local.tuple_nodes(key);
        }

        let candidates = self.forward_candidates(&group)?;
        let mut last_err = DhtError::NoCandidateNodes;
        for node in &candidates {
            let host = node.host();
            match self.transport.lookup(&host, key).await {
                Ok(nodes) => return Ok(nodes),
                Err(err) => {
                    warn!(%err, host = %host, "lookup forward failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Accumulate at least `min` nodes, walking the ring from the key's
    /// owning group through the next closest non-empty groups.
    ///
    /// Fails with [`DhtError::NodeNotFound`] when the ring wraps before
    /// `min` nodes accumulate.
    pub fn lookup_nodes(&self, key: &[u8], min: usize) -> Result<Vec<Node>, DhtError> {
        self.local.walk_nodes(key, min)
    }

    /// All members of the key's owning group, local or not.
    pub fn lookup_group_nodes(&self, key: &[u8]) -> Vec<Node> {
        self.owning_group(key).nodes()
    }

    /// Add a node to the DHT: compute its id from the address and insert it
    /// into the group the id maps to.
    pub fn add_node(&self, mut node: Node, force: bool) -> Result<(), DhtError> {
        node.id = self.conf.hasher.digest(node.addr.as_bytes());
        let group = self.groups.get(&node.id);
        group.add_node(node, force)
    }

    /// Remove a node from the membership view.
    ///
    /// When the departing node's owning group is the local group, every
    /// tuple referencing it is expired from the store first.
    pub fn remove_node(&self, host: &str) -> Result<(), DhtError> {
        let addr: HostAddr = host.parse()?;
        let group = self.groups.get(&self.conf.hasher.digest(addr.as_bytes()));
        if group.index() == self.local.idx {
            self.tuples.expire_host(&addr);
        }
        group.remove_node(host)
    }

    /// Record a ping observation for a member.
    pub fn ping_node(&self, host: &str, rtt: Duration) -> Result<(), DhtError> {
        let addr: HostAddr = host.parse()?;
        let group = self.groups.get(&self.conf.hasher.digest(addr.as_bytes()));
        group.ping_node(host, rtt)
    }

    /// Export the full node state: group count, membership union, and every
    /// tuple.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot {
            groups: self.conf.num_groups as u32,
            nodes: Vec::with_capacity(self.groups.node_count()),
            tuples: Vec::with_capacity(self.tuples.count()),
        };

        self.tuples.iter(&mut |key, hosts| {
            snapshot.tuples.push(TupleEntry {
                key: key.to_vec(),
                hosts: hosts.to_vec(),
            });
            true
        });
        self.groups.iter_nodes(|node| {
            snapshot.nodes.push(node);
            true
        });

        snapshot
    }

    /// Reconstruct state from a snapshot: nodes first (forced, existing
    /// entries are fine), then every tuple through the regular insert path.
    ///
    /// Per-item failures are coalesced and the last one is returned.
    pub async fn seed(&self, snapshot: &Snapshot) -> Result<(), DhtError> {
        let mut last_err = None;

        for node in &snapshot.nodes {
            match self.add_node(node.clone(), true) {
                Ok(()) | Err(DhtError::NodeExists) => {}
                Err(err) => last_err = Some(err),
            }
        }

        for entry in &snapshot.tuples {
            for host in &entry.hosts {
                if let Err(err) = self.insert(&entry.key, *host).await {
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn local_group(&self) -> &LocalGroup {
        &self.local
    }
}
