//! Gossip-facing glue: membership events, broadcast payloads, and queries.
//!
//! The gossip layer itself is an external collaborator. It feeds the core
//! an [`Event`] stream (member joins, leaves, failures, user broadcasts,
//! queries) and accepts broadcast intents through the [`Broadcaster`]
//! trait. Payload formats are fixed here so interchangeable gossip
//! implementations stay wire-compatible:
//!
//! - the `insert` broadcast payload is `key ‖ tuple(18)`
//! - the `lookup` query reply is a MessagePack-encoded node list

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::core::{DhtError, HostAddr, KelipsNode, Node, Transport, HOST_ADDR_LEN};

/// User broadcast announcing a tuple insert.
pub const BROADCAST_INSERT: &str = "insert";
/// Query asking for the nodes holding a key.
pub const QUERY_LOOKUP: &str = "lookup";

/// A cluster member as reported by the gossip layer.
#[derive(Clone, Debug)]
pub struct Member {
    /// Gossip-layer name.
    pub name: String,
    /// Endpoint the member serves on.
    pub addr: HostAddr,
    /// Gossip-layer tags.
    pub tags: HashMap<String, String>,
}

/// Events delivered by the gossip collaborator.
#[derive(Debug)]
pub enum Event {
    /// Members joined the cluster.
    MemberJoin(Vec<Member>),
    /// Members left gracefully.
    MemberLeft(Vec<Member>),
    /// Members were declared failed.
    MemberFailed(Vec<Member>),
    /// A named user broadcast with an opaque payload.
    UserBroadcast {
        /// Broadcast name.
        name: String,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// A named query expecting a reply.
    Query {
        /// Query name.
        name: String,
        /// Opaque payload.
        payload: Vec<u8>,
        /// Channel the reply is sent on.
        reply: oneshot::Sender<Vec<u8>>,
    },
}

/// Outbound side of the gossip collaborator: fire-and-forget broadcasts.
pub trait Broadcaster: Send + Sync {
    /// Emit a named broadcast to the cluster.
    fn broadcast(&self, name: &str, payload: &[u8]) -> Result<(), DhtError>;
}

/// Compose the `insert` broadcast payload: `key ‖ tuple(18)`.
pub fn encode_insert_payload(key: &[u8], tuple: &HostAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + HOST_ADDR_LEN);
    out.extend_from_slice(key);
    out.extend_from_slice(tuple.as_bytes());
    out
}

/// Split an `insert` broadcast payload back into key and tuple.
pub fn decode_insert_payload(payload: &[u8]) -> Result<(&[u8], HostAddr), DhtError> {
    if payload.len() <= HOST_ADDR_LEN {
        return Err(DhtError::InvalidRequest(
            "insert broadcast: size too small".to_string(),
        ));
    }
    let split = payload.len() - HOST_ADDR_LEN;
    let tuple = HostAddr::from_bytes(&payload[split..])?;
    Ok((&payload[..split], tuple))
}

impl<T: Transport> KelipsNode<T> {
    /// Attach the gossip broadcaster used by
    /// [`broadcast_insert`](Self::broadcast_insert).
    pub fn register_broadcaster(&self, broadcaster: Arc<dyn Broadcaster>) {
        *self.broadcaster.write() = Some(broadcaster);
    }

    /// Announce an insert to the whole cluster through the gossip layer.
    ///
    /// Receivers store the tuple only when the key hashes into their own
    /// group. A no-op when no broadcaster is registered.
    pub fn broadcast_insert(&self, key: &[u8], tuple: &HostAddr) -> Result<(), DhtError> {
        let guard = self.broadcaster.read();
        match guard.as_ref() {
            Some(broadcaster) => {
                broadcaster.broadcast(BROADCAST_INSERT, &encode_insert_payload(key, tuple))
            }
            None => Ok(()),
        }
    }

    /// Apply one gossip event to the local state.
    pub fn handle_event(&self, event: Event) {
        match event {
            Event::MemberJoin(members) => {
                for member in members {
                    let mut node = Node::new(member.addr);
                    node.name = member.name;
                    node.tags = member.tags;
                    node.heartbeats = 1;
                    node.last_seen = SystemTime::now();
                    match self.add_node(node, false) {
                        Ok(()) => {}
                        Err(DhtError::NodeExists) => {
                            debug!(host = %member.addr, "join for known member");
                        }
                        Err(err) => warn!(%err, host = %member.addr, "failed to add member"),
                    }
                }
            }
            Event::MemberLeft(members) | Event::MemberFailed(members) => {
                for member in members {
                    let host = member.addr.to_string();
                    if let Err(err) = self.remove_node(&host) {
                        warn!(%err, host = %host, "failed to remove member");
                    }
                }
            }
            Event::UserBroadcast { name, payload } => match name.as_str() {
                BROADCAST_INSERT => match decode_insert_payload(&payload) {
                    Ok((key, tuple)) => {
                        self.local_group().add_tuple(key, tuple);
                    }
                    Err(err) => warn!(%err, "discarding insert broadcast"),
                },
                other => debug!(name = other, "unhandled user broadcast"),
            },
            Event::Query {
                name,
                payload,
                reply,
            } => match name.as_str() {
                QUERY_LOOKUP => {
                    let nodes = self
                        .local_group()
                        .tuple_nodes(&payload)
                        .unwrap_or_default();
                    match rmp_serde::to_vec(&nodes) {
                        Ok(buf) => {
                            let _ = reply.send(buf);
                        }
                        Err(err) => warn!(%err, "failed to encode lookup reply"),
                    }
                }
                other => debug!(name = other, "unhandled query"),
            },
        }
    }

    /// Drive an event stream in the background until the sender closes.
    pub fn spawn_events(self: &Arc<Self>, mut events: mpsc::Receiver<Event>) {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                node.handle_event(event);
            }
        });
    }
}
