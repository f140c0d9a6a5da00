//! Binary framing of the DHT's request/response datagrams.
//!
//! Every RPC is a single unfragmented datagram. The first request byte is
//! the message type; responses start with a status byte ([`RESP_OK`] /
//! [`RESP_FAIL`]) followed by a MessagePack-encoded node list on success or
//! UTF-8 error text on failure.

use crate::core::{DhtError, HostAddr, Node, HOST_ADDR_LEN};

/// Resolve the nodes holding a key. Body: `key`.
pub const REQ_LOOKUP: u8 = 3;
/// Accumulate a minimum number of nodes. Body: `u16_be(min) ‖ key`.
pub const REQ_LOOKUP_NODES: u8 = 4;
/// Members of the key's owning group. Body: `key`.
pub const REQ_LOOKUP_GROUP_NODES: u8 = 5;
/// Store a tuple. Body: `propagate:u8 ‖ tuple(18) ‖ key`.
pub const REQ_INSERT: u8 = 6;
/// Remove a tuple. Body: `propagate:u8 ‖ tuple(18) ‖ key`.
pub const REQ_DELETE: u8 = 7;

/// Success status byte.
pub const RESP_OK: u8 = 10;
/// Failure status byte; the rest of the frame is error text.
pub const RESP_FAIL: u8 = 11;

/// Maximum datagram size. Callers must not assume larger replies succeed.
pub const MAX_DATAGRAM_SIZE: usize = 65_000;

/// A decoded request frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Resolve the nodes holding `key`.
    Lookup {
        /// The opaque key.
        key: Vec<u8>,
    },
    /// Accumulate at least `min` nodes for `key`.
    LookupNodes {
        /// Minimum number of nodes requested.
        min: u16,
        /// The opaque key.
        key: Vec<u8>,
    },
    /// Members of `key`'s owning group.
    LookupGroupNodes {
        /// The opaque key.
        key: Vec<u8>,
    },
    /// Store `tuple` under `key`.
    Insert {
        /// Whether the receiver fans out within the owning group.
        propagate: bool,
        /// The endpoint tuple.
        tuple: HostAddr,
        /// The opaque key.
        key: Vec<u8>,
    },
    /// Remove `tuple` from `key`; the all-zero tuple removes the whole key.
    Delete {
        /// Whether the receiver fans out within the owning group.
        propagate: bool,
        /// The endpoint tuple.
        tuple: HostAddr,
        /// The opaque key.
        key: Vec<u8>,
    },
}

impl Request {
    /// Serialise the request into a datagram payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::Lookup { key } => prefixed(REQ_LOOKUP, &[], key),
            Request::LookupNodes { min, key } => prefixed(REQ_LOOKUP_NODES, &min.to_be_bytes(), key),
            Request::LookupGroupNodes { key } => prefixed(REQ_LOOKUP_GROUP_NODES, &[], key),
            Request::Insert {
                propagate,
                tuple,
                key,
            } => write_frame(REQ_INSERT, *propagate, tuple, key),
            Request::Delete {
                propagate,
                tuple,
                key,
            } => write_frame(REQ_DELETE, *propagate, tuple, key),
        }
    }

    /// Parse a datagram payload, validating the length for its type.
    pub fn decode(frame: &[u8]) -> Result<Self, DhtError> {
        let (&typ, body) = frame
            .split_first()
            .ok_or_else(|| DhtError::InvalidRequest("empty request".to_string()))?;

        match typ {
            REQ_LOOKUP => Ok(Request::Lookup {
                key: non_empty_key(body, "lookup")?,
            }),
            REQ_LOOKUP_NODES => {
                if body.len() < 3 {
                    return Err(DhtError::InvalidRequest(
                        "lookup nodes: size too small".to_string(),
                    ));
                }
                Ok(Request::LookupNodes {
                    min: u16::from_be_bytes([body[0], body[1]]),
                    key: body[2..].to_vec(),
                })
            }
            REQ_LOOKUP_GROUP_NODES => Ok(Request::LookupGroupNodes {
                key: non_empty_key(body, "lookup group nodes")?,
            }),
            REQ_INSERT => {
                let (propagate, tuple, key) = read_frame(body, "insert")?;
                Ok(Request::Insert {
                    propagate,
                    tuple,
                    key,
                })
            }
            REQ_DELETE => {
                let (propagate, tuple, key) = read_frame(body, "delete")?;
                Ok(Request::Delete {
                    propagate,
                    tuple,
                    key,
                })
            }
            other => Err(DhtError::InvalidRequest(format!(
                "unknown request type: {other}"
            ))),
        }
    }
}

fn prefixed(typ: u8, head: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + head.len() + key.len());
    out.push(typ);
    out.extend_from_slice(head);
    out.extend_from_slice(key);
    out
}

fn write_frame(typ: u8, propagate: bool, tuple: &HostAddr, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + HOST_ADDR_LEN + key.len());
    out.push(typ);
    out.push(u8::from(propagate));
    out.extend_from_slice(tuple.as_bytes());
    out.extend_from_slice(key);
    out
}

fn read_frame(body: &[u8], name: &str) -> Result<(bool, HostAddr, Vec<u8>), DhtError> {
    // 1 propagate byte + 18 tuple bytes + at least 1 key byte
    if body.len() < 2 + HOST_ADDR_LEN {
        return Err(DhtError::InvalidRequest(format!("{name}: size too small")));
    }
    let propagate = body[0] == 1;
    let tuple = HostAddr::from_bytes(&body[1..1 + HOST_ADDR_LEN])?;
    Ok((propagate, tuple, body[1 + HOST_ADDR_LEN..].to_vec()))
}

fn non_empty_key(body: &[u8], name: &str) -> Result<Vec<u8>, DhtError> {
    if body.is_empty() {
        return Err(DhtError::InvalidRequest(format!("{name}: key required")));
    }
    Ok(body.to_vec())
}

/// Bare success response for writes.
pub fn encode_ack() -> Vec<u8> {
    vec![RESP_OK]
}

/// Success response carrying a node list.
pub fn encode_nodes(nodes: &[Node]) -> Result<Vec<u8>, DhtError> {
    let body = rmp_serde::to_vec(nodes).map_err(|err| DhtError::Internal(err.to_string()))?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(RESP_OK);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Failure response carrying error text.
pub fn encode_fail(msg: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + msg.len());
    out.push(RESP_FAIL);
    out.extend_from_slice(msg.as_bytes());
    out
}

/// Parse a response frame into its node list.
///
/// A bare `OK` yields an empty list; `FAIL` yields
/// [`DhtError::Transport`] wrapping the remote error text.
pub fn decode_response(frame: &[u8]) -> Result<Vec<Node>, DhtError> {
    match frame.split_first() {
        None => Err(DhtError::InvalidRequest("empty response".to_string())),
        Some((&RESP_OK, rest)) => {
            if rest.is_empty() {
                return Ok(Vec::new());
            }
            rmp_serde::from_slice(rest).map_err(|err| DhtError::Internal(err.to_string()))
        }
        Some((&RESP_FAIL, rest)) => Err(DhtError::Transport(
            String::from_utf8_lossy(rest).into_owned(),
        )),
        Some((&other, _)) => Err(DhtError::InvalidRequest(format!(
            "unknown response status: {other}"
        ))),
    }
}
