use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use kelips_dht::{
    Config, DhtError, GroupRpc, HostAddr, KelipsNode, Node, Transport, UdpClient, UdpTransport,
};

/// Serves RPCs straight out of a key-to-hosts map, so the transport and
/// codec can be exercised without a full node.
#[derive(Default)]
struct MapRpc {
    hosts: Mutex<HashMap<Vec<u8>, Vec<HostAddr>>>,
}

impl MapRpc {
    fn nodes_for(&self, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        match self.hosts.lock().get(key) {
            Some(hosts) => Ok(hosts.iter().map(|host| Node::new(*host)).collect()),
            None => Err(DhtError::KeyNotFound),
        }
    }
}

#[async_trait]
impl GroupRpc for MapRpc {
    async fn lookup(&self, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        self.nodes_for(key)
    }

    async fn lookup_nodes(&self, key: &[u8], _min: usize) -> Result<Vec<Node>, DhtError> {
        self.nodes_for(key)
    }

    async fn lookup_group_nodes(&self, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        if key == b"empty" {
            return Ok(Vec::new());
        }
        self.nodes_for(key)
    }

    async fn insert(&self, key: &[u8], tuple: HostAddr, _propagate: bool) -> Result<(), DhtError> {
        let mut hosts = self.hosts.lock();
        let entry = hosts.entry(key.to_vec()).or_default();
        if !entry.contains(&tuple) {
            entry.push(tuple);
        }
        Ok(())
    }

    async fn delete(&self, key: &[u8], tuple: HostAddr, _propagate: bool) -> Result<(), DhtError> {
        let mut hosts = self.hosts.lock();
        if tuple.is_unspecified() {
            hosts.remove(key).ok_or(DhtError::KeyNotFound)?;
            return Ok(());
        }
        if let Some(entry) = hosts.get_mut(key) {
            entry.retain(|h| h != &tuple);
        }
        Ok(())
    }
}

async fn serve_map_rpc() -> (UdpTransport, String, Arc<MapRpc>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let host = socket.local_addr().expect("local addr").to_string();
    let trans = UdpTransport::new(socket);
    let rpc = Arc::new(MapRpc::default());
    trans.register(rpc.clone());
    (trans, host, rpc)
}

#[tokio::test]
async fn insert_lookup_delete_over_loopback() {
    let (t1, _h1, _) = serve_map_rpc().await;
    let (_t2, h2, _) = serve_map_rpc().await;

    let tuple: HostAddr = "127.0.0.1:23456".parse().unwrap();
    t1.insert(&h2, b"key", tuple, false).await.expect("insert");

    let nodes = t1.lookup(&h2, b"key").await.expect("lookup");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].addr, tuple);
    assert_eq!(nodes[0].addr.port(), 23456);

    t1.delete(&h2, b"key", tuple, false).await.expect("delete");
    let err = t1.lookup(&h2, b"key").await.expect_err("tuple removed");
    assert!(matches!(err, DhtError::Transport(_)));
}

#[tokio::test]
async fn remote_errors_surface_as_transport_failures() {
    let (t1, _h1, _) = serve_map_rpc().await;
    let (_t2, h2, _) = serve_map_rpc().await;

    let err = t1.lookup(&h2, b"missing").await.expect_err("unknown key");
    assert_eq!(err, DhtError::Transport("key not found".to_string()));

    // An empty node list is reported as a failure, not an empty reply.
    let err = t1
        .lookup_group_nodes(&h2, b"empty")
        .await
        .expect_err("no nodes");
    assert_eq!(err, DhtError::Transport("no nodes found".to_string()));
}

#[tokio::test]
async fn requests_to_silent_peers_time_out() {
    let (t1, _h1, _) = serve_map_rpc().await;
    let t1 = t1.with_rpc_timeout(std::time::Duration::from_millis(200));

    // Bind a socket that never answers.
    let silent = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let host = silent.local_addr().expect("local addr").to_string();

    let err = t1.lookup(&host, b"key").await.expect_err("no reply");
    assert!(matches!(err, DhtError::Transport(_)));
}

#[tokio::test]
async fn ping_measures_live_peers_and_skips_self() {
    let (t1, h1, _) = serve_map_rpc().await;
    let (_t2, h2, rpc2) = serve_map_rpc().await;

    let addr2: HostAddr = h2.parse().unwrap();
    rpc2.insert(addr2.as_bytes(), addr2, false)
        .await
        .expect("prime remote view");

    let mut peer = Node::new(addr2);
    peer.name = h2.clone();
    let rtt = t1.ping(&peer).await;
    assert!(!rtt.is_zero(), "live peer yields a measurement");

    let this: HostAddr = h1.parse().unwrap();
    let rtt = t1.ping(&Node::new(this)).await;
    assert!(rtt.is_zero(), "self ping is skipped");
}

#[tokio::test]
async fn client_round_robins_over_peers() {
    let (_t1, h1, rpc1) = serve_map_rpc().await;

    let client = UdpClient::new(vec![h1.clone()]).expect("client");
    let tuple: HostAddr = "127.0.0.1:23456".parse().unwrap();
    client.insert(b"key", tuple).await.expect("insert");
    assert_eq!(rpc1.hosts.lock().get(&b"key"[..]).unwrap().len(), 1);

    let nodes = client.lookup(b"key").await.expect("lookup");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].addr, tuple);

    client.delete(b"key", tuple).await.expect("delete");
    assert!(UdpClient::new(Vec::new()).is_err());
}

#[tokio::test]
async fn a_full_node_serves_its_own_wire_requests() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let host = socket.local_addr().expect("local addr").to_string();
    let node = KelipsNode::create(Config::new(&host), UdpTransport::new(socket)).expect("create");

    let addr: HostAddr = host.parse().unwrap();
    node.insert(b"key", addr).await.expect("insert");
    let holders = node.lookup(b"key").await.expect("lookup");
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].host(), host);

    // An external client sees the same state over the wire.
    let client = UdpClient::new(vec![host.clone()]).expect("client");
    let holders = client.lookup(b"key").await.expect("remote lookup");
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].host(), host);
}
