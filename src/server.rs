//! DHT protocol server for handling incoming RPC requests.
//!
//! [`serve`] reads datagrams off the bound socket and spawns one handler
//! per datagram. Each handler validates the frame for its message type,
//! dispatches into the registered [`GroupRpc`], and writes a single
//! response datagram back to the sender.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

use crate::core::{DhtError, GroupRpc, Node};
use crate::protocol::{self, Request, MAX_DATAGRAM_SIZE};

/// Accept datagrams on `socket` and serve them out of `rpc` until the
/// socket fails permanently.
pub(crate) async fn serve(socket: Arc<UdpSocket>, rpc: Arc<dyn GroupRpc>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, remote) = match socket.recv_from(&mut buf).await {
            Ok(recv) => recv,
            Err(err) => {
                error!(%err, "datagram receive failed");
                continue;
            }
        };
        let frame = buf[..len].to_vec();
        tokio::spawn(handle_datagram(socket.clone(), rpc.clone(), frame, remote));
    }
}

/// Serve one inbound datagram and reply to its sender.
async fn handle_datagram(
    socket: Arc<UdpSocket>,
    rpc: Arc<dyn GroupRpc>,
    frame: Vec<u8>,
    remote: SocketAddr,
) {
    let resp = match Request::decode(&frame) {
        Ok(request) => dispatch(rpc, request).await,
        Err(err) => {
            debug!(%err, %remote, "rejecting malformed request");
            protocol::encode_fail(&err.to_string())
        }
    };

    if resp.len() >= MAX_DATAGRAM_SIZE {
        error!(
            size = resp.len(),
            max = MAX_DATAGRAM_SIZE,
            "response too big"
        );
    }

    match socket.send_to(&resp, remote).await {
        Ok(written) if written != resp.len() => {
            error!(written, expected = resp.len(), "incomplete response write");
        }
        Ok(_) => {}
        Err(err) => error!(%err, %remote, "failed to write response"),
    }
}

/// Invoke the matching local RPC and encode its outcome.
async fn dispatch(rpc: Arc<dyn GroupRpc>, request: Request) -> Vec<u8> {
    match request {
        Request::Lookup { key } => {
            trace!(key = %hex::encode(&key), "handling lookup request");
            nodes_response(rpc.lookup(&key).await, true)
        }
        Request::LookupNodes { min, key } => {
            trace!(key = %hex::encode(&key), min, "handling lookup nodes request");
            nodes_response(rpc.lookup_nodes(&key, usize::from(min)).await, false)
        }
        Request::LookupGroupNodes { key } => {
            trace!(key = %hex::encode(&key), "handling lookup group nodes request");
            nodes_response(rpc.lookup_group_nodes(&key).await, true)
        }
        Request::Insert {
            propagate,
            tuple,
            key,
        } => {
            debug!(key = %hex::encode(&key), host = %tuple, propagate, "handling insert request");
            ack_response(rpc.insert(&key, tuple, propagate).await)
        }
        Request::Delete {
            propagate,
            tuple,
            key,
        } => {
            debug!(key = %hex::encode(&key), host = %tuple, propagate, "handling delete request");
            ack_response(rpc.delete(&key, tuple, propagate).await)
        }
    }
}

fn nodes_response(result: Result<Vec<Node>, DhtError>, reject_empty: bool) -> Vec<u8> {
    match result {
        Ok(nodes) if reject_empty && nodes.is_empty() => protocol::encode_fail("no nodes found"),
        Ok(nodes) => match protocol::encode_nodes(&nodes) {
            Ok(resp) => resp,
            Err(err) => protocol::encode_fail(&err.to_string()),
        },
        Err(err) => protocol::encode_fail(&err.to_string()),
    }
}

fn ack_response(result: Result<(), DhtError>) -> Vec<u8> {
    match result {
        Ok(()) => protocol::encode_ack(),
        Err(err) => protocol::encode_fail(&err.to_string()),
    }
}
