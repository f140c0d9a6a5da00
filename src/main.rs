use std::env;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::time::{self, Duration};

use kelips_dht::{Config, KelipsNode, UdpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let advertise = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:54540".to_string());
    let num_groups: usize = env::args()
        .nth(2)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(2);

    let socket = UdpSocket::bind(&advertise).await?;
    let mut conf = Config::new(&advertise);
    conf.num_groups = num_groups;
    let node = KelipsNode::create(conf, UdpTransport::new(socket))?;

    let local = node.local_node();
    println!("kelips node started");
    println!("  id (hex): {}", hex::encode(&local.id));
    println!("  host:     {}", local.host());
    println!("  groups:   {num_groups}");

    // Periodic state summary, useful when eyeballing a small test cluster.
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let snapshot = stats_node.snapshot();
            println!(
                "state: nodes={} tuples={} groups={}",
                snapshot.nodes.len(),
                snapshot.tuples.len(),
                snapshot.groups,
            );
        }
    });

    // Park the main task; inserts and lookups arrive over the wire.
    std::future::pending::<()>().await;
    Ok(())
}
