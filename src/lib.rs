//! # Kelips DHT
//!
//! This crate implements the core of a Kelips-style distributed hash
//! table: a partitioned, gossip-assisted, two-hop lookup service mapping
//! opaque keys to lists of host endpoints. Nodes hash into a fixed number
//! of **affinity groups**; every key hashes into exactly one group whose
//! members collectively store the key-to-endpoint mapping, so any lookup
//! reaches the owning group in at most one network hop.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: the transport-agnostic engine, including the group table,
//!   membership views, tuple store, and [`KelipsNode`] itself.
//! - [`net`]: a UDP [`Transport`] implementation ([`UdpTransport`]) plus a
//!   thin [`UdpClient`] for talking to an existing cluster.
//! - [`protocol`]: the binary request/response datagram framing.
//! - [`server`]: the inbound dispatch loop serving RPCs out of the local
//!   node.
//! - [`events`]: the gossip-facing seam: membership [`Event`]s, broadcast
//!   payloads, and the [`Broadcaster`] trait.
//!
//! ## Getting started
//!
//! Bind a socket, wrap it in a transport, and create the node. Membership
//! arrives from the gossip collaborator as events:
//!
//! ```no_run
//! use kelips_dht::{Config, Event, HostAddr, KelipsNode, Member, UdpTransport};
//! use tokio::net::UdpSocket;
//!
//! # async fn launch() -> Result<(), Box<dyn std::error::Error>> {
//! let socket = UdpSocket::bind("127.0.0.1:54540").await?;
//! let node = KelipsNode::create(Config::new("127.0.0.1:54540"), UdpTransport::new(socket))?;
//!
//! let peer: HostAddr = "127.0.0.1:54541".parse()?;
//! node.handle_event(Event::MemberJoin(vec![Member {
//!     name: "peer".to_string(),
//!     addr: peer,
//!     tags: Default::default(),
//! }]));
//!
//! node.insert(b"key", peer).await?;
//! let holders = node.lookup(b"key").await?;
//! # let _ = holders;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` demonstrates how to wire these pieces
//! together into a self-contained node.

pub mod core;
pub mod events;
pub mod net;
pub mod protocol;
pub mod server;

pub use crate::core::{
    AffinityGroup, AffinityGroups, Config, DhtError, GroupRpc, HostAddr, InmemTuples, KelipsNode,
    KeyHasher, Node, NodeId, Sha256Hasher, Snapshot, Transport, TupleEntry, TupleStore,
    HOST_ADDR_LEN,
};
pub use crate::events::{Broadcaster, Event, Member};
pub use crate::net::{UdpClient, UdpTransport};
