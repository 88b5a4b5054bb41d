//! Runs one member of a Raft key-value cluster behind its HTTP RPC server.
//!
//! Start a 3-node cluster on one machine. `state.json` sits directly in the
//! data directory, so nodes sharing a machine need one directory each:
//! ```bash
//! # Terminal 1
//! cargo run --bin node -- --node-id n1 --listen 127.0.0.1:7101 \
//!   --data-dir raft-data/n1 \
//!   --peer-ids n2,n3 --peer-addresses 127.0.0.1:7102,127.0.0.1:7103
//!
//! # Terminal 2
//! cargo run --bin node -- --node-id n2 --listen 127.0.0.1:7102 \
//!   --data-dir raft-data/n2 \
//!   --peer-ids n1,n3 --peer-addresses 127.0.0.1:7101,127.0.0.1:7103
//!
//! # Terminal 3
//! cargo run --bin node -- --node-id n3 --listen 127.0.0.1:7103 \
//!   --data-dir raft-data/n3 \
//!   --peer-ids n1,n2 --peer-addresses 127.0.0.1:7101,127.0.0.1:7102
//! ```
//!
//! The same settings can come from `NODE_ID`, `LISTEN_ADDR`, `PEER_IDS`,
//! `PEER_ADDRESSES`, `RAFT_DATA_DIR`, `RPC_TIMEOUT_MS` and `RAFT_SEED`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use raft_kv::cli::NodeArgs;
use raft_kv::peer::Peer;
use raft_kv::runtime::spawn_node;
use raft_kv::server;
use raft_kv::transport::HttpPeer;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = NodeArgs::parse();
    let mut peers: Vec<Arc<dyn Peer>> = Vec::new();
    for (id, address) in args.peers()? {
        let peer = HttpPeer::new(id.clone(), &address, args.rpc_timeout())
            .with_context(|| format!("failed to set up peer {id}"))?;
        info!(peer = %id, url = %peer.base_url(), "registered peer");
        peers.push(Arc::new(peer));
    }

    let handle = spawn_node(args.node_config(), peers).context("failed to start node")?;
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(node = %args.node_id, addr = %listener.local_addr()?, "rpc server listening");

    let app = server::router(handle.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    if let Err(err) = handle.shutdown().await {
        warn!(error = %err, "node did not stop cleanly");
    }
    served.context("rpc server failed")?;
    info!(node = %args.node_id, "shut down");
    Ok(())
}
