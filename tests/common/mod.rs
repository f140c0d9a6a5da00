use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use kelips_dht::{
    Config, DhtError, Event, GroupRpc, HostAddr, KelipsNode, KeyHasher, Member, Node, Transport,
};

/// Two-byte test keyspace: the digest is the trailing two bytes of the
/// input. Host addresses end in the big-endian port, so the port picks the
/// node's group; key suffixes pick the key's group. With two groups the
/// boundary is 0x8000: ports below 32768 land in group 0, above in group 1.
pub struct TailHasher;

impl KeyHasher for TailHasher {
    fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 2];
        for (slot, byte) in out.iter_mut().rev().zip(data.iter().rev()) {
            *slot = *byte;
        }
        out
    }

    fn output_size(&self) -> usize {
        2
    }
}

/// Routes transport calls directly to the registered peer RPCs.
#[derive(Default)]
pub struct Registry {
    peers: RwLock<HashMap<String, Arc<dyn GroupRpc>>>,
}

impl Registry {
    fn get(&self, host: &str) -> Option<Arc<dyn GroupRpc>> {
        self.peers.read().get(host).cloned()
    }
}

/// In-memory [`Transport`] with per-host failure injection and call
/// recording.
#[derive(Clone)]
pub struct TestTransport {
    registry: Arc<Registry>,
    self_host: String,
    failures: Arc<Mutex<HashSet<String>>>,
    lookup_calls: Arc<Mutex<Vec<String>>>,
    insert_calls: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl TestTransport {
    pub fn new(registry: Arc<Registry>, self_host: &str) -> Self {
        Self {
            registry,
            self_host: self_host.to_string(),
            failures: Arc::new(Mutex::new(HashSet::new())),
            lookup_calls: Arc::new(Mutex::new(Vec::new())),
            insert_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_failure(&self, host: &str, fail: bool) {
        let mut failures = self.failures.lock();
        if fail {
            failures.insert(host.to_string());
        } else {
            failures.remove(host);
        }
    }

    pub fn lookup_calls(&self) -> Vec<String> {
        self.lookup_calls.lock().clone()
    }

    pub fn insert_calls(&self) -> Vec<(String, Vec<u8>)> {
        self.insert_calls.lock().clone()
    }

    fn peer(&self, host: &str) -> Result<Arc<dyn GroupRpc>, DhtError> {
        if self.failures.lock().contains(host) {
            return Err(DhtError::Transport("injected network failure".to_string()));
        }
        self.registry
            .get(host)
            .ok_or_else(|| DhtError::Transport(format!("peer not reachable: {host}")))
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn lookup(&self, host: &str, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        self.lookup_calls.lock().push(host.to_string());
        self.peer(host)?.lookup(key).await
    }

    async fn lookup_nodes(
        &self,
        host: &str,
        key: &[u8],
        min: usize,
    ) -> Result<Vec<Node>, DhtError> {
        self.peer(host)?.lookup_nodes(key, min).await
    }

    async fn lookup_group_nodes(&self, host: &str, key: &[u8]) -> Result<Vec<Node>, DhtError> {
        self.peer(host)?.lookup_group_nodes(key).await
    }

    async fn insert(
        &self,
        host: &str,
        key: &[u8],
        tuple: HostAddr,
        propagate: bool,
    ) -> Result<(), DhtError> {
        self.insert_calls.lock().push((host.to_string(), key.to_vec()));
        self.peer(host)?.insert(key, tuple, propagate).await
    }

    async fn delete(
        &self,
        host: &str,
        key: &[u8],
        tuple: HostAddr,
        propagate: bool,
    ) -> Result<(), DhtError> {
        self.peer(host)?.delete(key, tuple, propagate).await
    }

    async fn ping(&self, node: &Node) -> Duration {
        let host = node.host();
        if host == self.self_host || self.registry.get(&host).is_none() {
            return Duration::ZERO;
        }
        Duration::from_millis(1)
    }

    fn register(&self, rpc: Arc<dyn GroupRpc>) {
        self.registry
            .peers
            .write()
            .insert(self.self_host.clone(), rpc);
    }
}

/// A node wired to the in-memory transport with the two-byte test hasher.
pub struct TestNode {
    pub node: Arc<KelipsNode<TestTransport>>,
    pub transport: TestTransport,
    pub host: String,
}

impl TestNode {
    pub fn create(registry: &Arc<Registry>, port: u16, num_groups: usize) -> Self {
        Self::create_with(registry, port, num_groups, |_| {})
    }

    pub fn create_with(
        registry: &Arc<Registry>,
        port: u16,
        num_groups: usize,
        tweak: impl FnOnce(&mut Config),
    ) -> Self {
        let host = format!("127.0.0.1:{port}");
        let transport = TestTransport::new(registry.clone(), &host);
        let mut conf = Config::new(&host);
        conf.num_groups = num_groups;
        conf.hasher = Arc::new(TailHasher);
        // Keep the health checker quiet for the duration of a test.
        conf.heartbeat_interval = Duration::from_secs(3600);
        tweak(&mut conf);
        let node = KelipsNode::create(conf, transport.clone()).expect("create node");
        Self {
            node,
            transport,
            host,
        }
    }

    pub fn addr(&self) -> HostAddr {
        self.host.parse().expect("valid host")
    }

    pub fn member(&self) -> Member {
        Member {
            name: self.host.clone(),
            addr: self.addr(),
            tags: HashMap::new(),
        }
    }
}

/// Make every node aware of every other through membership join events.
pub fn join_all(nodes: &[&TestNode]) {
    for node in nodes {
        let members: Vec<Member> = nodes
            .iter()
            .filter(|other| other.host != node.host)
            .map(|other| other.member())
            .collect();
        node.node.handle_event(Event::MemberJoin(members));
    }
}
