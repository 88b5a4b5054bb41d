//! HTTP gateway in front of a Raft key-value cluster.
//!
//! ```bash
//! cargo run --bin gateway -- --listen 127.0.0.1:8000 \
//!   --node-ids n1,n2,n3 \
//!   --node-addresses 127.0.0.1:7101,127.0.0.1:7102,127.0.0.1:7103
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::net::TcpListener;
use tracing::info;

use raft_gateway::routes::router;
use raft_gateway::{Gateway, GatewayConfig};
use raft_kv::cli::pair_ids_with_addresses;
use raft_kv::peer::Peer;
use raft_kv::transport::{DEFAULT_RPC_TIMEOUT, HttpPeer};

#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP gateway for a Raft key-value cluster", long_about = None)]
struct GatewayArgs {
    /// Address the gateway binds to.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Comma-separated ids of every cluster node.
    #[arg(long, env = "NODE_IDS", value_delimiter = ',', required = true)]
    node_ids: Vec<String>,

    /// Comma-separated node addresses, in `--node-ids` order.
    #[arg(long, env = "NODE_ADDRESSES", value_delimiter = ',', required = true)]
    node_addresses: Vec<String>,

    /// Timeout of a single node call, in milliseconds. Writes wait for a
    /// commit, so this is longer than the node-to-node timeout.
    #[arg(long, env = "GATEWAY_TIMEOUT_MS", default_value_t = 2000)]
    timeout_ms: u64,

    /// Seed for the random node choice. Random when unset.
    #[arg(long, env = "GATEWAY_SEED")]
    seed: Option<u64>,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = GatewayArgs::parse();
    let timeout = Duration::from_millis(args.timeout_ms).max(DEFAULT_RPC_TIMEOUT);
    let mut nodes: Vec<Arc<dyn Peer>> = Vec::new();
    for (id, address) in pair_ids_with_addresses(&args.node_ids, &args.node_addresses)? {
        let node = HttpPeer::new(id.clone(), &address, timeout)
            .with_context(|| format!("failed to set up node {id}"))?;
        info!(node = %id, url = %node.base_url(), "registered node");
        nodes.push(Arc::new(node));
    }

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let gateway = Gateway::new(nodes, GatewayConfig::default(), rng)?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(addr = %listener.local_addr()?, "gateway listening");

    axum::serve(listener, router(Arc::new(gateway)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("gateway server failed")?;
    Ok(())
}
