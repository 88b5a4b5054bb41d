use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;

use crate::config::NodeConfig;
use crate::types::NodeId;

/// Every flag can also come from the environment, which is how containers
/// configure a node.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run one member of a Raft key-value cluster", long_about = None)]
pub struct NodeArgs {
    /// Id of this node; must be unique in the cluster.
    #[arg(long, env = "NODE_ID")]
    pub node_id: NodeId,

    /// Address the RPC server binds to.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Comma-separated ids of the other members.
    #[arg(long, env = "PEER_IDS", value_delimiter = ',')]
    pub peer_ids: Vec<String>,

    /// Comma-separated addresses of the other members, in `--peer-ids` order.
    #[arg(long, env = "PEER_ADDRESSES", value_delimiter = ',')]
    pub peer_addresses: Vec<String>,

    /// Directory holding `state.json` and `{node_id}log.dat`.
    #[arg(long, env = "RAFT_DATA_DIR", default_value = "raft-data")]
    pub data_dir: PathBuf,

    /// Timeout of a single peer RPC, in milliseconds.
    #[arg(long, env = "RPC_TIMEOUT_MS", default_value_t = 250)]
    pub rpc_timeout_ms: u64,

    /// Seed for the election timer jitter. Random when unset.
    #[arg(long, env = "RAFT_SEED")]
    pub seed: Option<u64>,
}

impl NodeArgs {
    /// Per-call timeout of replication RPCs.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Node settings; state files go straight into `--data-dir`.
    pub fn node_config(&self) -> NodeConfig {
        let config = NodeConfig::new(self.node_id.clone(), self.data_dir.clone());
        match self.seed {
            Some(seed) => config.with_seed(seed),
            None => config,
        }
    }

    /// `(id, address)` of every peer.
    pub fn peers(&self) -> Result<Vec<(NodeId, String)>> {
        let peers = pair_ids_with_addresses(&self.peer_ids, &self.peer_addresses)?;
        if peers.iter().any(|(id, _)| *id == self.node_id) {
            bail!("node {} is listed among its own peers", self.node_id);
        }
        Ok(peers)
    }
}

/// Zips two comma-separated lists, ignoring blank items.
pub fn pair_ids_with_addresses(ids: &[String], addresses: &[String]) -> Result<Vec<(NodeId, String)>> {
    let clean = |items: &[String]| -> Vec<String> {
        items
            .iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    };
    let ids = clean(ids);
    let addresses = clean(addresses);

    if ids.len() != addresses.len() {
        bail!(
            "got {} ids but {} addresses; the lists must line up",
            ids.len(),
            addresses.len()
        );
    }
    Ok(ids.into_iter().zip(addresses).collect())
}
