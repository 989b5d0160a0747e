//! `dht-node`: a minimal standalone DHT node.
//!
//! Binds a UDP socket, starts the KRPC runtime with `ping` and `find_node`
//! registered, optionally pings a bootstrap peer and follows up with
//! `find_node(own_id)` against it, then idles until Ctrl-C.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use clap::Parser;
use kadem::node_id::NodeInfo;
use kadem::routing::RoutingTable;
use kadem::runtime::MethodRegistry;
use kadem::{methods, NodeId, Runtime};
use tokio::sync::Mutex;
use tracing::{info, warn};

const DEFAULT_BUCKET_CAPACITY: usize = 8;

#[derive(Parser, Debug)]
#[command(name = "dht-node", about = "A Kademlia-style BitTorrent DHT node")]
struct Args {
    /// Address to bind the UDP socket on.
    #[arg(long, default_value = "0.0.0.0:6881")]
    bind: SocketAddr,

    /// This node's 40-hex-character ID. Random if omitted.
    #[arg(long)]
    node_id: Option<String>,

    /// A bootstrap peer to ping, then ask for neighbors of our own ID.
    #[arg(long)]
    bootstrap: Option<SocketAddr>,

    /// `tracing-subscriber` env-filter directive, e.g. `debug` or `kadem=trace`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let own_id = match args.node_id {
        Some(hex) => NodeId::from_hex(&hex)?,
        None => NodeId::random(),
    };
    info!(node_id = %own_id, bind = %args.bind, "starting dht-node");

    let runtime = Runtime::bind(args.bind, own_id).await?;
    let local_addr = runtime.local_addr()?;
    let own_addr = match local_addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, local_addr.port()),
    };
    let own_contact = NodeInfo::new(own_id, own_addr);

    let table = Arc::new(Mutex::new(RoutingTable::new(own_id, DEFAULT_BUCKET_CAPACITY)));

    let mut registry = MethodRegistry::new(own_id);
    methods::register_find_node(&mut registry, table.clone(), own_contact);
    let receive_loop = runtime.start(registry);

    if let Some(bootstrap) = args.bootstrap {
        match runtime.ping(bootstrap).await {
            Ok(peer_id) => {
                info!(peer = %bootstrap, peer_id = %peer_id, "bootstrap ping succeeded");
                table.lock().await.add(NodeInfo::new(
                    peer_id,
                    match bootstrap {
                        SocketAddr::V4(addr) => addr,
                        SocketAddr::V6(_) => {
                            warn!("bootstrap peer has an ipv6 address, skipping table insert");
                            own_addr
                        }
                    },
                ));
                match runtime.find_node(bootstrap, own_id).await {
                    Ok(nodes) => {
                        info!(count = nodes.len(), "bootstrap find_node returned neighbors");
                        let mut table = table.lock().await;
                        for node in nodes {
                            table.add(node);
                        }
                    }
                    Err(e) => warn!(error = %e, "bootstrap find_node failed"),
                }
            }
            Err(e) => warn!(peer = %bootstrap, error = %e, "bootstrap ping failed"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    runtime.shutdown();
    let _ = receive_loop.await;

    Ok(())
}
