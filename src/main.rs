use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use lattica::{
    CacheConfig, Dht, DhtConfig, Discovery, DiscoveryConfig, EventBus, InMemoryTransport, Peer,
    PeerCache, TransportHub,
};

#[derive(Parser, Debug)]
#[command(name = "lattica")]
#[command(author, version, about = "In-process peer-discovery mesh demo", long_about = None)]
struct Args {
    /// Number of nodes in the in-process mesh.
    #[arg(short, long, default_value = "8")]
    nodes: u16,

    /// Seconds between telemetry snapshots.
    #[arg(short, long, default_value = "10")]
    telemetry_interval: u64,

    /// Seconds between discovery rounds.
    #[arg(short, long, default_value = "5")]
    discovery_interval: u64,
}

async fn spawn_node(
    hub: &TransportHub,
    port: u16,
    discovery_interval: Duration,
) -> Result<Discovery<InMemoryTransport>> {
    let endpoint = format!("127.0.0.1:{port}");
    let (transport, inbox) = hub.register(&endpoint).await;

    let dht = Dht::new(DhtConfig::default(), "127.0.0.1", port, transport)?;
    dht.run_inbox(inbox);

    let cache = PeerCache::new(CacheConfig::default())?;
    let events = Arc::new(EventBus::new());
    let discovery = Discovery::new(
        dht,
        cache,
        events,
        DiscoveryConfig { discovery_interval, ..DiscoveryConfig::default() },
    )?;
    Ok(discovery)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let hub = TransportHub::new();
    let discovery_interval = Duration::from_secs(args.discovery_interval.max(1));
    let base_port = 42000u16;

    let mut mesh = Vec::new();
    for i in 0..args.nodes.max(2) {
        let node = spawn_node(&hub, base_port + i, discovery_interval).await?;
        mesh.push(node);
    }

    // Everyone bootstraps off node 0.
    let seed = Peer::from_node(&mesh[0].dht().local_node());
    info!(seed = %seed.peer_id, nodes = mesh.len(), "starting mesh");
    mesh[0].start(Vec::new()).await?;
    for node in mesh.iter().skip(1) {
        node.start(vec![seed.clone()]).await?;
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, stopping mesh");
                break;
            }
            _ = interval.tick() => {
                for (i, node) in mesh.iter().enumerate() {
                    let dht_stats = node.dht().stats().await;
                    let discovery_stats = node.stats().await;
                    let cache_stats = node.cache().stats().await;
                    info!(
                        node = i,
                        routing = dht_stats.routing_table_size,
                        known = discovery_stats.known_peers,
                        connected = discovery_stats.connected_peers,
                        rounds = discovery_stats.discovery_rounds,
                        hit_rate = format!("{:.2}", cache_stats.hit_rate),
                        latency_ms = format!("{:.2}", dht_stats.avg_request_latency_ms),
                        "telemetry"
                    );
                }
            }
        }
    }

    for node in &mesh {
        node.stop().await;
    }
    Ok(())
}
