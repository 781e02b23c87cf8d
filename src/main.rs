use torrent_dht::{DhtConfig, InfoHash, MainlineDht, PeerContactInfo};

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ROUTERS: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "67.215.246.10:6881",
];

/// Mainline DHT node: joins the network and looks up peers for info-hashes.
#[derive(Parser, Debug)]
#[command(name = "torrent-dht")]
#[command(version)]
struct Cli {
    /// Local UDP address
    #[arg(long, default_value = "0.0.0.0:6881")]
    bind: SocketAddr,

    /// Bootstrap node as host:port, may be repeated
    #[arg(long)]
    bootstrap: Vec<String>,

    /// Info-hash (40 hex characters) to search for, may be repeated
    #[arg(long = "info-hash")]
    info_hash: Vec<InfoHash>,

    /// Peer-wire port to announce; defaults to the UDP source port
    #[arg(long)]
    port: Option<u16>,

    /// Per-query timeout
    #[arg(long, default_value_t = 3)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = DhtConfig {
        bind_addr: cli.bind,
        announce_port: cli.port,
        query_timeout: Duration::from_secs(cli.timeout_secs),
        client_version: Some(b"TD01".to_vec()),
        ..DhtConfig::default()
    };

    let dht = MainlineDht::bind(config).await.context("failed to bind dht")?;
    dht.start();

    let (tx, mut rx) = mpsc::unbounded_channel::<(InfoHash, Vec<PeerContactInfo>)>();
    dht.add_peer_discovery_listener(Arc::new(tx));

    let routers: Vec<String> = if cli.bootstrap.is_empty() {
        ROUTERS.iter().map(|r| r.to_string()).collect()
    } else {
        cli.bootstrap
    };
    for router in &routers {
        let addrs = match tokio::net::lookup_host(router.as_str()).await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(%router, error = %e, "cannot resolve bootstrap node");
                continue;
            }
        };
        for addr in addrs.filter(SocketAddr::is_ipv4) {
            match dht.add_bootstrap_node_address(addr).await {
                Ok(()) => info!(%addr, nodes = dht.routing_table_size().await, "bootstrapped"),
                Err(e) => warn!(%addr, error = %e, "bootstrap failed"),
            }
        }
    }

    for info_hash in cli.info_hash {
        dht.register_info_hash(info_hash).await;
    }

    loop {
        tokio::select! {
            Some((info_hash, peers)) = rx.recv() => {
                for peer in peers {
                    info!(%info_hash, %peer, "peer");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    dht.stop().await;
    Ok(())
}
